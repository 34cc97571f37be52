//! Write transaction lifecycle.
//!
//! A [`WriteTransaction`] is scoped to a single `write_tuples` call. Its
//! terminal state is tracked explicitly so that a rollback issued after the
//! transaction has already been closed is an expected transition, not an
//! error.

use std::fmt;

use sqlx::{Database, Pool, Transaction};
use tracing::{debug, error};

use crate::error::{StorageError, StorageResult};

/// Lifecycle state of a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// Outcome of requesting a terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The transaction was open and is now in the requested state.
    Proceed,
    /// The transaction had already reached this terminal state.
    AlreadyClosed(TxState),
}

impl TxState {
    pub fn is_open(&self) -> bool {
        matches!(self, TxState::Open)
    }

    /// Moves an open transaction into `target`. A closed transaction is left
    /// untouched.
    pub fn close(&mut self, target: TxState) -> Transition {
        match *self {
            TxState::Open => {
                *self = target;
                Transition::Proceed
            }
            closed => Transition::AlreadyClosed(closed),
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxState::Open => f.write_str("open"),
            TxState::Committed => f.write_str("committed"),
            TxState::RolledBack => f.write_str("rolled back"),
        }
    }
}

/// A database transaction with an explicit terminal state.
///
/// Dropping an open transaction rolls it back through the driver.
pub struct WriteTransaction<DB: Database> {
    tx: Option<Transaction<'static, DB>>,
    state: TxState,
}

impl<DB: Database> WriteTransaction<DB> {
    /// Begins a transaction on a pooled connection.
    pub async fn begin(pool: &Pool<DB>) -> StorageResult<Self> {
        let tx = pool
            .begin()
            .await
            .map_err(|e| StorageError::wrap("failed to begin transaction", e))?;
        Ok(Self {
            tx: Some(tx),
            state: TxState::Open,
        })
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Connection to run statements on. Fails once the transaction is closed.
    pub fn connection(&mut self) -> StorageResult<&mut DB::Connection> {
        match self.tx.as_mut() {
            Some(tx) if self.state.is_open() => Ok(&mut **tx),
            _ => Err(StorageError::internal(format!(
                "transaction already {}",
                self.state
            ))),
        }
    }

    pub async fn commit(&mut self) -> StorageResult<()> {
        if let Transition::AlreadyClosed(state) = self.state.close(TxState::Committed) {
            return Err(StorageError::internal(format!(
                "cannot commit: transaction already {state}"
            )));
        }
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StorageError::internal("transaction handle missing"))?;
        tx.commit().await.map_err(|e| {
            // The driver discards the connection's transaction on a failed commit.
            self.state = TxState::RolledBack;
            StorageError::wrap("failed to commit transaction", e)
        })
    }

    /// Rolls back an open transaction. Succeeds without touching the
    /// database if the transaction is already closed.
    pub async fn rollback(&mut self) -> StorageResult<()> {
        if let Transition::AlreadyClosed(state) = self.state.close(TxState::RolledBack) {
            debug!(%state, "rollback requested on closed transaction");
            return Ok(());
        }
        match self.tx.take() {
            Some(tx) => tx
                .rollback()
                .await
                .map_err(|e| StorageError::wrap("failed to roll back transaction", e)),
            None => Ok(()),
        }
    }
}

impl<DB: Database> fmt::Debug for WriteTransaction<DB> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Rolls back after a failed write. Only genuine rollback failures are
/// logged; the caller keeps reporting the error that caused the rollback.
pub(crate) async fn rollback_tx<DB: Database>(tx: &mut WriteTransaction<DB>) {
    if let Err(e) = tx.rollback().await {
        error!(error = %e, "failed to roll back transaction");
    }
}
