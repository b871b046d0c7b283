//! Operation results and the store's error kinds.
//!
//! Every mutation returns an [`OpRet`]: either resolved immediately, or
//! `delayed` and resolved exactly once by the persist tracker when the
//! corresponding upload lands. Callers that care about durability await
//! [`OpRet::wait`]; callers that only need local completion drop it.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;

/// Error kinds surfaced by the store and the persistent tier.
///
/// `NotFound` and `Deleted` are distinct on purpose: a deleted chunk still
/// has an entry (and a deletion note) and must not be recovered, while a
/// missing chunk is a candidate for recovery from the blob tier.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,

    #[error("chunk deleted: {0}")]
    Deleted(String),

    #[error("chunk incomplete")]
    Incomplete,

    #[error("out of storage capacity")]
    OOStorage,

    #[error("connection failed: {0}")]
    NetworkFailed(String),

    #[error("recover is not supported")]
    RecoveryUnsupported,

    #[error("invalid argument: {0}")]
    ProtocolArg(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),
}

/// `None` = still pending, `Some(None)` = done, `Some(Some(e))` = failed.
type OpState = Option<Option<StoreError>>;

struct OpInner {
    delayed: bool,
    state: Mutex<OpState>,
    done_tx: watch::Sender<bool>,
}

/// Completion handle for a store operation.
#[derive(Clone)]
pub struct OpRet {
    inner: Arc<OpInner>,
}

impl OpRet {
    fn new(delayed: bool, state: OpState) -> Self {
        let (done_tx, _) = watch::channel(state.is_some());
        Self {
            inner: Arc::new(OpInner {
                delayed,
                state: Mutex::new(state),
                done_tx,
            }),
        }
    }

    /// An operation that completed locally with no persistence pending.
    pub fn success() -> Self {
        Self::new(false, Some(None))
    }

    /// An operation that failed before reaching the persistent tier.
    pub fn error(err: StoreError) -> Self {
        Self::new(false, Some(Some(err)))
    }

    /// An operation whose outcome arrives later from the tracker.
    pub fn delayed_success() -> Self {
        Self::new(true, None)
    }

    pub fn is_delayed(&self) -> bool {
        self.inner.delayed
    }

    /// The error recorded so far. A pending delayed operation reports `None`.
    pub fn err(&self) -> Option<StoreError> {
        match self.inner.state.lock() {
            Ok(state) => state.clone().flatten(),
            Err(_) => None,
        }
    }

    /// Resolve the operation. Only the first call takes effect.
    pub fn done(&self, err: Option<StoreError>) {
        if let Ok(mut state) = self.inner.state.lock() {
            if state.is_none() {
                *state = Some(err);
            }
        }
        let _ = self.inner.done_tx.send(true);
    }

    /// Wait until the operation resolves and return its outcome.
    pub async fn wait(&self) -> Result<(), StoreError> {
        let mut rx = self.inner.done_tx.subscribe();
        loop {
            if let Ok(state) = self.inner.state.lock() {
                if let Some(outcome) = state.clone() {
                    return match outcome {
                        None => Ok(()),
                        Some(err) => Err(err),
                    };
                }
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

impl std::fmt::Debug for OpRet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpRet")
            .field("delayed", &self.inner.delayed)
            .field("err", &self.err())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_results_resolve_without_waiting() {
        let ok = OpRet::success();
        assert!(!ok.is_delayed());
        assert_eq!(ok.err(), None);

        let failed = OpRet::error(StoreError::OOStorage);
        assert_eq!(failed.err(), Some(StoreError::OOStorage));
    }

    #[tokio::test]
    async fn delayed_result_resolves_once() {
        let ret = OpRet::delayed_success();
        assert!(ret.is_delayed());
        assert_eq!(ret.err(), None);

        let waiter = {
            let ret = ret.clone();
            tokio::spawn(async move { ret.wait().await })
        };

        ret.done(Some(StoreError::UploadFailed("boom".into())));
        // A second resolution is ignored.
        ret.done(None);

        let outcome = waiter.await.expect("join waiter");
        assert_eq!(outcome, Err(StoreError::UploadFailed("boom".into())));
        assert_eq!(ret.err(), Some(StoreError::UploadFailed("boom".into())));
    }

    #[tokio::test]
    async fn wait_returns_for_already_done() {
        let ret = OpRet::delayed_success();
        ret.done(None);
        assert_eq!(ret.wait().await, Ok(()));
    }
}
