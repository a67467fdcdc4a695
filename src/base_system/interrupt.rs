//! Process interrupt wiring.
//!
//! One SIGINT handler flips an atomic cancel flag and pokes a channel the
//! coordinator selects on. Repeated interrupts during shutdown are swallowed
//! by the flag swap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::info;

#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    rx: Receiver<()>,
    // keeps the channel connected even if every handle is dropped
    _tx: Sender<()>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Fires at most once, on the first cancellation.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    /// A token that can never fire; for runs that opt out of cancellation.
    pub fn never() -> Self {
        pair().1
    }
}

#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    tx: Sender<()>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            let _ = self.tx.try_send(());
        }
    }
}

/// A manually triggered flag/token pair.
pub fn pair() -> (CancelHandle, CancelToken) {
    let flag = Arc::new(AtomicBool::new(false));
    let (tx, rx) = bounded(1);
    (
        CancelHandle {
            flag: Arc::clone(&flag),
            tx: tx.clone(),
        },
        CancelToken { flag, rx, _tx: tx },
    )
}

/// Install the process-wide SIGINT handler. Callable once per process.
pub fn install() -> anyhow::Result<CancelToken> {
    let (handle, token) = pair();
    ctrlc::set_handler(move || {
        info!("interrupt received");
        handle.cancel();
    })?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_fires_once() {
        let (handle, token) = pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(token.receiver().try_recv().is_ok());
        assert!(token.receiver().try_recv().is_err());
    }
}
