//! Operator interrupt handling.
//!
//! The first Ctrl-C raises a shared flag. A transfer that observes the flag
//! reports an indeterminate outcome and the cycle moves on to polling; the
//! process is not torn down. A second Ctrl-C exits immediately with 130.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

/// Exit status used when the operator insists on aborting.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Cheaply cloneable interrupt flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Listen for Ctrl-C on a dedicated thread and raise `flag` on the first one.
pub fn spawn_ctrl_c_listener(flag: InterruptFlag) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if flag.is_raised() {
                        warn!("second interrupt received, aborting");
                        std::process::exit(INTERRUPTED_EXIT_CODE);
                    }
                    flag.raise();
                    warn!(
                        "interrupt received; the local archive will be kept unless the remote store confirms it (Ctrl-C again to abort)"
                    );
                }
            });
        })?;

    Ok(())
}
