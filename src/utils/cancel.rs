//! Cancellation tokens
//!
//! A token is cancelled when it, or any token it was derived from, is
//! cancelled. Cancelling a child never affects its parent.

use futures::future::select_all;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug)]
struct Inner {
    flag: watch::Sender<bool>,
    parent: Option<CancelToken>,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_set(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without cancelling: never resolves.
            std::future::pending::<()>().await;
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner { flag, parent: None }),
        }
    }

    pub fn child(&self) -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                flag,
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.lineage().any(|t| *t.inner.flag.borrow())
    }

    fn lineage(&self) -> impl Iterator<Item = &CancelToken> {
        std::iter::successors(Some(self), |t| t.inner.parent.as_ref())
    }

    /// Resolves once this token or an ancestor is cancelled.
    pub async fn cancelled(&self) {
        let waits: Vec<_> = self
            .lineage()
            .map(|t| Box::pin(wait_set(t.inner.flag.subscribe())))
            .collect();
        select_all(waits).await;
    }
}
