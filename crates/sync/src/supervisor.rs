//! Capability-scoped failure boundary.
//!
//! Fallible engine work (a poll cycle, a user action, a location callback)
//! runs under a [`Supervisor`]. Failures are logged, turned into a
//! [`Notice`] for the UI shell, and replaced by a fallback so that no error
//! takes the engine down.

use std::future::Future;

use tokio::sync::broadcast;

use crate::error::{Notice, NoticeKind, SyncError};

/// Default buffer for undelivered notices.
pub const DEFAULT_NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct Supervisor {
    notices: broadcast::Sender<Notice>,
}

impl Supervisor {
    pub fn new(capacity: usize) -> Self {
        let (notices, _) = broadcast::channel(capacity.max(1));
        Self { notices }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Log `err` and broadcast the matching notice.
    pub fn report(&self, context: &'static str, err: &SyncError) -> Notice {
        let notice = err.to_notice();
        match notice.kind {
            NoticeKind::PersistentPrompt => {
                tracing::warn!(context, error = %err, "Action needs user attention");
            }
            NoticeKind::Transient => {
                tracing::warn!(context, error = %err, "Engine operation failed");
            }
            NoticeKind::Benign => {
                tracing::debug!(context, error = %err, "Benign conflict");
            }
        }
        // No receivers simply means no UI is listening.
        let _ = self.notices.send(notice.clone());
        notice
    }

    /// Run `work`; on failure report it and substitute `None`.
    pub async fn guard<T, F>(&self, context: &'static str, work: F) -> Option<T>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        match work.await {
            Ok(value) => Some(value),
            Err(e) => {
                self.report(context, &e);
                None
            }
        }
    }

    /// Run `work`; report any failure and hand the result back unchanged.
    pub async fn observe<T, F>(&self, context: &'static str, work: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        let result = work.await;
        if let Err(e) = &result {
            self.report(context, e);
        }
        result
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(DEFAULT_NOTICE_CAPACITY)
    }
}
