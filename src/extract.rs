//! The extraction collaborator interface.
//!
//! The engine never talks to a language model directly; it consumes the
//! [`SettingExtractor`] trait. Credential rotation state is an explicit
//! configuration object owned by the caller, not process-wide state, so
//! deterministic fakes can be injected in tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tracing::warn;

use crate::error::ValidationError;
use crate::patch::{ConflictReport, FactPatch};
use crate::snapshot::WorldSnapshot;

/// Errors produced by the extraction collaborator.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The upstream service signalled a concurrency/rate limit. Warrants
    /// exactly one retry on a rotated credential.
    #[error("extraction rate limited: {message}")]
    RateLimited {
        /// Upstream message.
        message: String,
    },

    /// Any other upstream failure; surfaced without retry.
    #[error("extraction upstream failure: {message}")]
    Upstream {
        /// Upstream message.
        message: String,
    },

    /// Output that does not parse as the expected structure. Treated like
    /// an upstream failure: the chapter stays unprocessed.
    #[error("malformed extraction output: {reason}")]
    MalformedPatch {
        /// Parse failure description.
        reason: String,
    },
}

impl ExtractError {
    /// Returns true for the rate-limit condition that warrants one retry.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// The narrative-text-to-facts collaborator.
///
/// Implementations receive the credential to use for this call; the pool
/// and retry policy live in [`ExtractionConfig`] on the engine side.
pub trait SettingExtractor: Send + Sync {
    /// Extracts a fact patch for one chapter, given the settings valid at
    /// the end of the previous chapter.
    ///
    /// # Errors
    ///
    /// Any [`ExtractError`]; only `RateLimited` is retried, once.
    fn extract(
        &self,
        credential: &str,
        chapter_text: &str,
        prior: &WorldSnapshot,
    ) -> Result<FactPatch, ExtractError>;

    /// Checks one chapter's text against prior settings for contradictions.
    ///
    /// # Errors
    ///
    /// Any [`ExtractError`]; only `RateLimited` is retried, once.
    fn detect_conflicts(
        &self,
        credential: &str,
        prior: &WorldSnapshot,
        chapter_text: &str,
    ) -> Result<ConflictReport, ExtractError>;
}

/// An ordered pool of upstream credentials with a rotating cursor.
#[derive(Debug)]
pub struct CredentialPool {
    keys: Vec<String>,
    current: AtomicUsize,
}

impl CredentialPool {
    /// Creates a pool from an ordered credential list.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyCredentialPool`] for an empty list.
    pub fn new(keys: Vec<String>) -> Result<Self, ValidationError> {
        if keys.is_empty() {
            return Err(ValidationError::EmptyCredentialPool);
        }
        Ok(Self {
            keys,
            current: AtomicUsize::new(0),
        })
    }

    /// A single-entry pool with an empty credential, for collaborators
    /// that need none (local fakes, self-hosted models).
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            keys: vec![String::new()],
            current: AtomicUsize::new(0),
        }
    }

    /// The credential the next call should use.
    #[must_use]
    pub fn current(&self) -> String {
        let idx = self.current.load(Ordering::Relaxed) % self.keys.len();
        self.keys[idx].clone()
    }

    /// Advances to the next credential (wrapping) and returns it.
    pub fn rotate(&self) -> String {
        let prev = self.current.fetch_add(1, Ordering::Relaxed);
        let idx = (prev + 1) % self.keys.len();
        warn!(
            from = prev % self.keys.len(),
            to = idx,
            "rotating extraction credential"
        );
        self.keys[idx].clone()
    }

    /// Number of credentials in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when the pool holds no credentials. Both constructors forbid
    /// that state, so this stays `false` for any pool they return.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Extraction call policy: the credential pool plus the retry bound.
#[derive(Debug)]
pub struct ExtractionConfig {
    /// Credential rotation state.
    pub pool: CredentialPool,

    /// Retry once on a rate-limit signature. All other failures surface
    /// immediately. Defaults to true.
    pub retry_on_rate_limit: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            pool: CredentialPool::anonymous(),
            retry_on_rate_limit: true,
        }
    }
}

impl ExtractionConfig {
    /// Creates a config with the given pool and the default retry bound.
    #[must_use]
    pub fn new(pool: CredentialPool) -> Self {
        Self {
            pool,
            retry_on_rate_limit: true,
        }
    }

    /// Calls `extract` with the current credential, retrying exactly once
    /// on a rate-limit signature with a rotated credential.
    ///
    /// # Errors
    ///
    /// The final [`ExtractError`] after the bounded retry.
    pub fn call_extract(
        &self,
        extractor: &dyn SettingExtractor,
        chapter_text: &str,
        prior: &WorldSnapshot,
    ) -> Result<FactPatch, ExtractError> {
        match extractor.extract(&self.pool.current(), chapter_text, prior) {
            Err(e) if e.is_rate_limited() && self.retry_on_rate_limit => {
                warn!(error = %e, "extract rate limited, retrying once on rotated credential");
                let key = self.pool.rotate();
                extractor.extract(&key, chapter_text, prior)
            }
            other => other,
        }
    }

    /// Calls `detect_conflicts` with the same bounded-retry policy as
    /// [`Self::call_extract`].
    ///
    /// # Errors
    ///
    /// The final [`ExtractError`] after the bounded retry.
    pub fn call_detect_conflicts(
        &self,
        extractor: &dyn SettingExtractor,
        prior: &WorldSnapshot,
        chapter_text: &str,
    ) -> Result<ConflictReport, ExtractError> {
        match extractor.detect_conflicts(&self.pool.current(), prior, chapter_text) {
            Err(e) if e.is_rate_limited() && self.retry_on_rate_limit => {
                warn!(error = %e, "conflict check rate limited, retrying once on rotated credential");
                let key = self.pool.rotate();
                extractor.detect_conflicts(&key, prior, chapter_text)
            }
            other => other,
        }
    }
}
