//! Credential persistence.
//!
//! A store holds at most one [`TokenSet`], the one belonging to the configured
//! account. Loading never fails: anything that cannot be turned back into a
//! usable record is reported and treated as absence.

mod file;

pub use file::FileCredentialStore;

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::AuthError;
use crate::token::TokenSet;

/// Errors raised while writing or clearing a credential record.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The record could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The temporary file could not be moved over the record.
    #[error("Failed to replace credential record: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Durable single-record persistence for the current token set.
pub trait CredentialStore: Send + Sync + 'static {
    /// Loads the stored record, or `None` if there is no usable one.
    fn load(&self) -> Option<TokenSet>;

    /// Replaces the stored record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be written. The previous
    /// record is left intact in that case.
    fn save(&self, tokens: &TokenSet) -> Result<(), StoreError>;

    /// Removes the stored record. Clearing an absent record succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing record could not be removed.
    fn clear(&self) -> Result<(), StoreError>;

    /// Removes the stored record only if `stale` accepts it, checking and
    /// removing as one step with respect to other writers.
    ///
    /// Returns true if a record was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if a matching record could not be removed.
    fn clear_if(&self, stale: &dyn Fn(&TokenSet) -> bool) -> Result<bool, StoreError>;
}

impl<T: CredentialStore + ?Sized> CredentialStore for Arc<T> {
    fn load(&self) -> Option<TokenSet> {
        (**self).load()
    }

    fn save(&self, tokens: &TokenSet) -> Result<(), StoreError> {
        (**self).save(tokens)
    }

    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }

    fn clear_if(&self, stale: &dyn Fn(&TokenSet) -> bool) -> Result<bool, StoreError> {
        (**self).clear_if(stale)
    }
}

/// Process-local store, useful for tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    record: Mutex<Option<TokenSet>>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store already holding `tokens`.
    #[must_use]
    pub fn with_tokens(tokens: TokenSet) -> Self {
        Self {
            record: Mutex::new(Some(tokens)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Option<TokenSet> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save(&self, tokens: &TokenSet) -> Result<(), StoreError> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = Some(tokens.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    fn clear_if(&self, stale: &dyn Fn(&TokenSet) -> bool) -> Result<bool, StoreError> {
        let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        if record.as_ref().is_some_and(stale) {
            record.take();
            return Ok(true);
        }
        Ok(false)
    }
}
