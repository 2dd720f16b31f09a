//! External run control: pause, resume and halt requests that the
//! orchestrator observes between phases.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::utils::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSignal {
    Run,
    Pause,
    Halt,
}

#[derive(Debug, Clone)]
pub struct RunControl {
    tx: Arc<watch::Sender<RunSignal>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RunSignal::Run);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        self.tx.send_replace(RunSignal::Pause);
    }

    pub fn resume(&self) {
        self.tx.send_if_modified(|s| {
            let paused = *s == RunSignal::Pause;
            if paused {
                *s = RunSignal::Run;
            }
            paused
        });
    }

    /// Sticky: a halted control never returns to `Run`.
    pub fn halt(&self) {
        self.tx.send_replace(RunSignal::Halt);
    }

    pub fn signal(&self) -> RunSignal {
        *self.tx.borrow()
    }

    /// Waits until the signal leaves `Pause`. Cancellation reads as `Halt`.
    pub async fn wait_while_paused(&self, cancel: &CancelToken) -> RunSignal {
        let mut rx = self.tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current != RunSignal::Pause {
                return current;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return RunSignal::Halt;
                    }
                }
                _ = cancel.cancelled() => return RunSignal::Halt,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_halt_is_sticky() {
        let control = RunControl::new();
        control.halt();
        control.resume();
        assert_eq!(control.signal(), RunSignal::Halt);
    }

    #[tokio::test]
    async fn test_wait_returns_on_resume() {
        let control = RunControl::new();
        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_while_paused(&CancelToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        control.resume();
        assert_eq!(waiter.await.unwrap(), RunSignal::Run);
    }

    #[test]
    fn test_wait_pends_until_resumed() {
        let control = RunControl::new();
        control.pause();
        let cancel = CancelToken::new();
        let mut wait = tokio_test::task::spawn(control.wait_while_paused(&cancel));
        tokio_test::assert_pending!(wait.poll());

        control.resume();
        assert!(wait.is_woken());
        tokio_test::assert_ready_eq!(wait.poll(), RunSignal::Run);
    }

    #[tokio::test]
    async fn test_cancel_while_paused_halts() {
        let control = RunControl::new();
        control.pause();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(control.wait_while_paused(&cancel).await, RunSignal::Halt);
    }
}
