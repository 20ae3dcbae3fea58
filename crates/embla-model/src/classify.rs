// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider error classification.
//!
//! Every backend reports failures as free text: HTTP status lines, JSON error
//! bodies, or connection errors stringified by reqwest.  This module maps
//! that text onto a small taxonomy the retry logic and the key pool can act
//! on.  Matching is case-insensitive and purely lexical — no provider is
//! special-cased.

use std::sync::OnceLock;
use std::time::Duration;

use regex::RegexSet;

/// The classified kind of a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Quota or throughput limit; retry after backoff.
    RateLimit,
    /// Credential rejected; rotating to another key may help, retrying the
    /// same one will not.
    Auth,
    /// The prompt does not fit the backend's context window; the caller must
    /// refit, not retry.
    ContextOverflow,
    /// Billing or account problems; retrying is pointless.
    NonRetryable,
    /// Server-side or network hiccup; retry with backoff.
    Transient,
}

struct Patterns {
    rate_limit: RegexSet,
    auth: RegexSet,
    context_overflow: RegexSet,
    non_retryable: RegexSet,
    transient: RegexSet,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        rate_limit: RegexSet::new([
            r"(?i)\b429\b",
            r"(?i)rate limit",
            r"(?i)too many requests",
            r"(?i)quota",
            r"(?i)overloaded",
        ])
        .expect("rate-limit patterns"),
        auth: RegexSet::new([
            r"(?i)\b401\b",
            r"(?i)\b403\b",
            r"(?i)unauthorized",
            r"(?i)forbidden",
            r"(?i)invalid api key",
            r"(?i)authentication",
        ])
        .expect("auth patterns"),
        context_overflow: RegexSet::new([
            r"(?i)context (length|window|limit)",
            r"(?i)too many tokens",
            r"(?i)maximum tokens",
            r"(?i)context_length_exceeded",
        ])
        .expect("context-overflow patterns"),
        non_retryable: RegexSet::new([
            r"(?i)billing",
            r"(?i)payment",
            r"(?i)insufficient funds",
        ])
        .expect("non-retryable patterns"),
        transient: RegexSet::new([
            r"(?i)\b50[0-4]\b",
            r"(?i)internal server error",
            r"(?i)bad gateway",
            r"(?i)service unavailable",
            r"(?i)gateway timeout",
            r"(?i)ECONNREFUSED",
            r"(?i)ECONNRESET",
            r"(?i)ETIMEDOUT",
            r"(?i)ENOTFOUND",
            r"(?i)network",
            r"(?i)fetch failed",
            r"(?i)socket",
        ])
        .expect("transient patterns"),
    })
}

/// Classify a provider error message.
///
/// Kinds are tested from most to least specific; anything unrecognised is
/// treated as transient so that a genuinely novel failure gets retried
/// rather than killing the turn.
pub fn classify(message: &str) -> ErrorKind {
    let p = patterns();
    if p.rate_limit.is_match(message) {
        return ErrorKind::RateLimit;
    }
    if p.auth.is_match(message) {
        return ErrorKind::Auth;
    }
    if p.context_overflow.is_match(message) {
        return ErrorKind::ContextOverflow;
    }
    if p.non_retryable.is_match(message) {
        return ErrorKind::NonRetryable;
    }
    if p.transient.is_match(message) {
        return ErrorKind::Transient;
    }
    ErrorKind::Transient
}

/// Whether a retry against the same provider can succeed.
pub fn is_retryable(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::RateLimit | ErrorKind::Transient)
}

/// Backoff delay before the given retry attempt (0-based).
///
/// Rate limits back off linearly and cap early — the limit window is usually
/// short.  Transient failures back off exponentially.
pub fn retry_delay(kind: ErrorKind, attempt: u32) -> Duration {
    match kind {
        ErrorKind::RateLimit => {
            Duration::from_secs(10).min(Duration::from_secs(2) * (attempt + 1))
        }
        _ => Duration::from_secs(1) * 2u32.pow(attempt.min(16)),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
