//! Process-wide rotation and cache tracker.
//!
//! One instance is created at startup and shared by every request. All
//! read-decide-write sequences run while holding the inner mutex, so a
//! request's regeneration decision and the matching counter update cannot
//! interleave with another request's. The CoT path holds its guard across
//! the auxiliary model call ([`CotSession`]); the fallback round-robin
//! advance is a separate short critical section.

use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::config::TrackerCacheSettings;

#[derive(Debug, Default)]
struct TrackerInner {
    last_user_message: String,
    last_cot_message: String,
    cot_round: u32,
    response_round: usize,
}

/// Shared mutable state: last user message seen, last generated CoT text,
/// and the two rotation counters.
#[derive(Debug, Default)]
pub struct Tracker {
    inner: Mutex<TrackerInner>,
    cache: Option<TrackerCacheSettings>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker mirrored to two UTF-8 text files for crash resilience.
    /// Call [`Tracker::restore`] afterwards to seed from an earlier run.
    pub fn with_cache(cache: TrackerCacheSettings) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
            cache: Some(cache),
        }
    }

    /// Seed the tracker from the cache files. Missing or unreadable files
    /// leave the corresponding field empty.
    pub async fn restore(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let user = tokio::fs::read_to_string(&cache.user_message_path)
            .await
            .unwrap_or_default();
        let cot = tokio::fs::read_to_string(&cache.cot_message_path)
            .await
            .unwrap_or_default();
        let mut inner = self.inner.lock().await;
        inner.last_user_message = user;
        inner.last_cot_message = cot;
    }

    /// Open a CoT session. The returned guard serializes the regeneration
    /// decision, the auxiliary call, and the store against other requests.
    pub async fn begin_cot(&self) -> CotSession<'_> {
        CotSession {
            guard: self.inner.lock().await,
            tracker: self,
        }
    }

    /// Round-robin pick over a fallback-model list of length `len`.
    /// Returns the index to use for this request and advances the counter:
    /// back to 0 after the last valid index, incremented otherwise.
    pub async fn advance_response_round(&self, len: usize) -> usize {
        debug_assert!(len > 0);
        let mut inner = self.inner.lock().await;
        let index = inner.response_round % len;
        inner.response_round = if index + 1 >= len { 0 } else { index + 1 };
        index
    }

    /// Last stored CoT text, as audit consumers see it.
    pub async fn last_cot_message(&self) -> String {
        self.inner.lock().await.last_cot_message.clone()
    }

    /// Last user message the tracker has committed.
    pub async fn last_user_message(&self) -> String {
        self.inner.lock().await.last_user_message.clone()
    }
}

/// Exclusive view over the tracker for one request's CoT phase.
pub struct CotSession<'a> {
    guard: MutexGuard<'a, TrackerInner>,
    tracker: &'a Tracker,
}

impl CotSession<'_> {
    /// Decide whether the CoT block must be regenerated and perform the
    /// rotation bookkeeping for this request.
    ///
    /// Regeneration is required when the incoming message is new (compared
    /// case-insensitively) and the rotation window has elapsed, when the
    /// cached CoT is empty or whitespace, or when `force` is set. The
    /// counter moves exactly once per new message whether or not
    /// regeneration runs: reset at a window boundary, incremented inside
    /// the window.
    pub fn decide(&mut self, incoming: &str, rotation_limit: u32, force: bool) -> bool {
        let is_new = self.guard.last_user_message.to_lowercase() != incoming.to_lowercase();
        let window_elapsed = self.guard.cot_round >= rotation_limit;

        if is_new {
            if window_elapsed {
                self.guard.cot_round = 0;
            } else {
                self.guard.cot_round += 1;
            }
        }

        force || self.guard.last_cot_message.trim().is_empty() || (is_new && window_elapsed)
    }

    /// Cached CoT text, reused verbatim when no regeneration is needed.
    pub fn cached_cot(&self) -> String {
        self.guard.last_cot_message.clone()
    }

    /// Commit a freshly generated CoT together with the message that
    /// triggered it, and mirror both to the cache files when configured.
    pub async fn store(&mut self, user_message: &str, cot_message: &str) {
        self.guard.last_user_message = user_message.to_string();
        self.guard.last_cot_message = cot_message.to_string();

        if let Some(cache) = &self.tracker.cache {
            if let Err(e) = tokio::fs::write(&cache.user_message_path, user_message).await {
                warn!(error = %e, "failed to mirror last user message to cache file");
            }
            if let Err(e) = tokio::fs::write(&cache.cot_message_path, cot_message).await {
                warn!(error = %e, "failed to mirror last CoT message to cache file");
            }
        }
    }
}
