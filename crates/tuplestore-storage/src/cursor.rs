//! Insertion-order ids and continuation tokens.
//!
//! Every tuple, change-log entry and authorization model is stamped with a
//! ULID at write time. ULIDs sort lexicographically in creation order, which
//! makes the id both the sort key and the pagination position.
//!
//! A [`ContinuationToken`] is the URL-safe base64 form of such an id. Callers
//! only ever receive tokens from this crate and hand them back unchanged.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use ulid::{Generator, Ulid};

use crate::error::{StorageError, StorageResult};

/// Globally unique, time-sortable row identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsertionOrderId(String);

impl InsertionOrderId {
    /// Wraps an id read back from storage.
    pub(crate) fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InsertionOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mints strictly increasing insertion-order ids.
///
/// Ids minted in the same millisecond increment the random component instead
/// of drawing a fresh one, so ordering holds for concurrent writers sharing
/// the generator.
pub struct IdGenerator {
    inner: Mutex<Generator>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    /// Returns the next id and the instant it was minted at.
    pub fn next_id(&self) -> StorageResult<(InsertionOrderId, DateTime<Utc>)> {
        let mut generator = self
            .inner
            .lock()
            .map_err(|_| StorageError::internal("id generator lock poisoned"))?;
        let ulid = generator
            .generate()
            .map_err(|e| StorageError::wrap("failed to generate insertion id", e))?;
        Ok((InsertionOrderId(ulid.to_string()), ulid_timestamp(ulid)))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}

fn ulid_timestamp(ulid: Ulid) -> DateTime<Utc> {
    // ULID timestamps are 48-bit milliseconds and always fit in i64.
    Utc.timestamp_millis_opt(ulid.timestamp_ms() as i64)
        .single()
        .unwrap_or_default()
}

/// Opaque pagination position handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub(crate) fn from_position(id: &InsertionOrderId) -> Self {
        Self(URL_SAFE_NO_PAD.encode(id.as_str()))
    }

    /// Position that precedes every id.
    pub fn origin() -> Self {
        Self::from_position(&InsertionOrderId(Ulid::nil().to_string()))
    }

    /// Decodes the position this token was issued for.
    pub(crate) fn position(&self) -> StorageResult<InsertionOrderId> {
        decode_position(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn decode_position(token: &str) -> StorageResult<InsertionOrderId> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| StorageError::InvalidContinuationToken)?;
    let position = String::from_utf8(bytes).map_err(|_| StorageError::InvalidContinuationToken)?;
    if position.is_empty() {
        return Err(StorageError::InvalidContinuationToken);
    }
    Ok(InsertionOrderId(position))
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContinuationToken {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_position(s)?;
        Ok(Self(s.to_string()))
    }
}
