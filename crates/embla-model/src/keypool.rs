// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Credential rotation for one provider.
//!
//! A pool holds an ordered list of interchangeable API keys.  Keys that
//! recently failed are put into a per-kind cooldown with exponential growth,
//! and `get()` rotates round-robin past them.  The pool never refuses to
//! hand out a key — when everything is cooling down it returns the key whose
//! cooldown expires soonest, because a request that waits is better than a
//! request that fails outright.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::classify::ErrorKind;

/// Per-kind cooldown policy: `cooldown = min(cap, base · 5^min(errors-1, max_exp))`.
struct CooldownPolicy {
    base: Duration,
    max_exp: u32,
    cap: Duration,
}

fn cooldown_policy(kind: ErrorKind) -> CooldownPolicy {
    match kind {
        ErrorKind::RateLimit => CooldownPolicy {
            base: Duration::from_secs(60),
            max_exp: 3,
            cap: Duration::from_secs(3600),
        },
        ErrorKind::Auth => CooldownPolicy {
            base: Duration::from_secs(5 * 60),
            max_exp: 2,
            cap: Duration::from_secs(24 * 3600),
        },
        ErrorKind::NonRetryable => CooldownPolicy {
            base: Duration::from_secs(5 * 3600),
            max_exp: 1,
            cap: Duration::from_secs(24 * 3600),
        },
        _ => CooldownPolicy {
            base: Duration::from_secs(30),
            max_exp: 3,
            cap: Duration::from_secs(15 * 60),
        },
    }
}

struct KeyState {
    credential: String,
    cooldown_until: Option<Instant>,
    consecutive_errors: u32,
    last_used: Option<Instant>,
}

impl KeyState {
    fn cooling_down(&self, now: Instant) -> bool {
        matches!(self.cooldown_until, Some(t) if t > now)
    }
}

struct PoolInner {
    keys: Vec<KeyState>,
    /// Index of the key handed out by the most recent `get()`.
    current: usize,
}

/// Rotating credential pool.  All mutation happens under one mutex so the
/// pool is safe to share across sessions.
pub struct KeyPool {
    inner: Mutex<PoolInner>,
}

impl KeyPool {
    /// Build a pool from an ordered credential list.
    ///
    /// # Panics
    /// Panics when `credentials` is empty — a provider without credentials
    /// must not be wrapped in a pool.
    pub fn new(credentials: Vec<String>) -> Self {
        assert!(!credentials.is_empty(), "key pool requires at least one credential");
        let keys = credentials
            .into_iter()
            .map(|credential| KeyState {
                credential,
                cooldown_until: None,
                consecutive_errors: 0,
                last_used: None,
            })
            .collect();
        Self { inner: Mutex::new(PoolInner { keys, current: 0 }) }
    }

    /// Number of keys in the pool.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().keys.len()
    }

    /// Number of keys currently usable (not in cooldown).
    pub fn available_count(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        inner.keys.iter().filter(|k| !k.cooling_down(now)).count()
    }

    /// Return a credential to use for the next request.
    ///
    /// Prefers the current key; when it is cooling down, advances round-robin
    /// to the first usable key.  When every key is cooling down, returns the
    /// one with the nearest expiry.  Always returns a key.
    pub fn get(&self) -> String {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let n = inner.keys.len();

        let mut chosen = None;
        for offset in 0..n {
            let idx = (inner.current + offset) % n;
            if !inner.keys[idx].cooling_down(now) {
                chosen = Some(idx);
                break;
            }
        }
        let idx = chosen.unwrap_or_else(|| {
            // All cooling down — pick the nearest expiry.
            inner
                .keys
                .iter()
                .enumerate()
                .min_by_key(|(_, k)| k.cooldown_until.unwrap_or(now))
                .map(|(i, _)| i)
                .unwrap_or(0)
        });

        inner.current = idx;
        inner.keys[idx].last_used = Some(now);
        inner.keys[idx].credential.clone()
    }

    /// Report that the most recently fetched key completed a request.
    /// Clears its error count and cooldown.
    pub fn report_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.current;
        inner.keys[idx].consecutive_errors = 0;
        inner.keys[idx].cooldown_until = None;
    }

    /// Report that the most recently fetched key failed with the given kind.
    ///
    /// Puts the key into a per-kind cooldown that grows with consecutive
    /// failures, then advances the rotation index so the next `get()` starts
    /// from a different key.
    pub fn report_error(&self, kind: ErrorKind) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.current;
        let key = &mut inner.keys[idx];
        key.consecutive_errors += 1;
        let policy = cooldown_policy(kind);
        let exp = (key.consecutive_errors - 1).min(policy.max_exp);
        let cooldown = policy.cap.min(policy.base * 5u32.pow(exp));
        key.cooldown_until = Some(now + cooldown);
        tracing::debug!(
            key_index = idx,
            errors = key.consecutive_errors,
            cooldown_secs = cooldown.as_secs(),
            ?kind,
            "key placed in cooldown"
        );
        let n = inner.keys.len();
        inner.current = (idx + 1) % n;
    }

    /// Remaining cooldown of the given key index (None when usable).
    /// Introspection for status displays and tests.
    pub fn cooldown_remaining(&self, index: usize) -> Option<Duration> {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        inner
            .keys
            .get(index)
            .and_then(|k| k.cooldown_until)
            .and_then(|t| t.checked_duration_since(now))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
