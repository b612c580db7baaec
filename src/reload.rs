//! Deferred page reload after a completed exchange.
//!
//! After a reply arrives the host page is refreshed so it shows whatever the
//! agent changed.  The refresh is staged: announce, wait, reload.  It runs on
//! its own task and can be aborted until the reload fires.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::transcript::{ChatMessage, TranscriptSink};
use crate::widget::PageController;

/// Message appended to the transcript before the page reloads.
pub const RELOAD_ANNOUNCEMENT: &str = "Reloading page to show workflow...";

/// Delay between the reply and the announcement.
pub const DEFAULT_ANNOUNCE_DELAY: Duration = Duration::from_millis(1000);

/// Delay between the announcement and the reload.
pub const DEFAULT_RELOAD_DELAY: Duration = Duration::from_millis(2000);

/// Whether and when to reload the page after an exchange completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReloadPolicy {
    /// Never reload.
    Disabled,
    /// Announce after `announce_delay`, reload `reload_delay` later.
    Staged {
        /// Delay before the announcement.
        announce_delay: Duration,
        /// Delay between announcement and reload.
        reload_delay: Duration,
    },
}

impl Default for ReloadPolicy {
    fn default() -> Self {
        ReloadPolicy::Staged {
            announce_delay: DEFAULT_ANNOUNCE_DELAY,
            reload_delay: DEFAULT_RELOAD_DELAY,
        }
    }
}

/// Owns the at-most-one pending reload.
#[derive(Debug)]
pub struct ReloadScheduler {
    policy: ReloadPolicy,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl ReloadScheduler {
    /// Creates a scheduler following `policy`.
    pub fn new(policy: ReloadPolicy) -> Self {
        Self {
            policy,
            pending: Mutex::new(None),
        }
    }

    /// The active policy.
    pub fn policy(&self) -> ReloadPolicy {
        self.policy
    }

    /// Starts the staged reload, replacing any reload still pending.
    ///
    /// Returns false when the policy is [`ReloadPolicy::Disabled`].
    pub fn schedule(
        &self,
        transcript: Arc<dyn TranscriptSink>,
        page: Arc<dyn PageController>,
    ) -> bool {
        let ReloadPolicy::Staged {
            announce_delay,
            reload_delay,
        } = self.policy
        else {
            return false;
        };
        let task = tokio::spawn(async move {
            tokio::time::sleep(announce_delay).await;
            transcript.append_message(ChatMessage::assistant(RELOAD_ANNOUNCEMENT));
            tokio::time::sleep(reload_delay).await;
            tracing::debug!("reloading page");
            page.reload();
        });
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(previous) = pending.replace(task) {
                previous.abort();
            }
        }
        true
    }

    /// Aborts the pending reload, if any.  Returns true if one was aborted.
    pub fn cancel(&self) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        match pending.take() {
            Some(task) if !task.is_finished() => {
                task.abort();
                tracing::debug!("pending reload aborted");
                true
            }
            _ => false,
        }
    }

    /// Returns true while a scheduled reload has not fired yet.
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .map(|pending| pending.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for ReloadScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
