// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-session serialization.
//!
//! Every producer (terminal, channel handler, HTTP surface, background
//! scheduler) funnels its work for a given session through that session's
//! [`SessionMutex`], so runs against the same conversation never interleave.
//! Waiters are granted the lock in strict arrival order (the fairness
//! guarantee of `tokio::sync::Mutex`), and a run that fails still hands the
//! lock to the next waiter because the guard releases on every exit path.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

/// The per-run deadline expired while waiting for or holding the lock.
#[derive(Debug, Clone, thiserror::Error)]
#[error("session run exceeded its {0:?} deadline")]
pub struct MutexTimeoutError(pub Duration);

#[derive(Default)]
pub struct SessionMutex {
    inner: Mutex<()>,
}

impl SessionMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the lock is free and take it.  Waiters resume in FIFO
    /// order on release.
    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }

    /// Acquire, run `f`, and release on all paths.
    ///
    /// With a deadline, the whole acquisition + run is raced against the
    /// clock; on expiry the future is dropped (releasing the lock if held)
    /// and [`MutexTimeoutError`] is returned so queued runs do not starve.
    pub async fn run<T, Fut>(
        &self,
        deadline: Option<Duration>,
        f: impl FnOnce() -> Fut,
    ) -> Result<T, MutexTimeoutError>
    where
        Fut: Future<Output = T>,
    {
        let work = async {
            let _guard = self.acquire().await;
            f().await
        };
        match deadline {
            Some(d) => tokio::time::timeout(d, work)
                .await
                .map_err(|_| MutexTimeoutError(d)),
            None => Ok(work.await),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
