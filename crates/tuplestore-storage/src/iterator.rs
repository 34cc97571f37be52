//! Page materialization over a live row stream.

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::cursor::{ContinuationToken, InsertionOrderId};
use crate::error::StorageResult;
use crate::traits::{ChangeRecord, ModelRecord, TupleRecord};

/// Upper bound on rows reserved up front for a page.
const PAGE_RESERVE_LIMIT: usize = 1024;

/// A row that carries its pagination position.
pub(crate) trait Positioned {
    fn position(&self) -> &InsertionOrderId;
}

impl Positioned for TupleRecord {
    fn position(&self) -> &InsertionOrderId {
        &self.ulid
    }
}

impl Positioned for ChangeRecord {
    fn position(&self) -> &InsertionOrderId {
        &self.ulid
    }
}

impl Positioned for ModelRecord {
    fn position(&self) -> &InsertionOrderId {
        &self.id
    }
}

/// Wraps the rows of a single query execution.
///
/// The iterator owns the underlying cursor until [`TupleIterator::close`] is
/// called or the iterator is dropped, whichever comes first.
pub(crate) struct TupleIterator<'a, T> {
    rows: Option<BoxStream<'a, StorageResult<T>>>,
}

impl<'a, T: Positioned + Send + 'a> TupleIterator<'a, T> {
    pub fn new(rows: impl Stream<Item = StorageResult<T>> + Send + 'a) -> Self {
        Self {
            rows: Some(rows.boxed()),
        }
    }

    /// Advances one row. `Ok(None)` signals end of data.
    pub async fn next(&mut self) -> StorageResult<Option<T>> {
        match self.rows.as_mut() {
            Some(rows) => rows.next().await.transpose(),
            None => Ok(None),
        }
    }

    /// Pulls up to `page_size` rows, then probes one more.
    ///
    /// The query fetched `page_size + 1` rows. If the probe finds nothing the
    /// page is the last one and no token is returned; otherwise the token is
    /// the position of the last row in the page. The probed row is discarded.
    /// A `page_size` of zero drains the stream and never yields a token.
    pub async fn materialize_page(
        mut self,
        page_size: usize,
    ) -> StorageResult<(Vec<T>, Option<ContinuationToken>)> {
        let result = self.fill_page(page_size).await;
        self.close();
        result
    }

    async fn fill_page(
        &mut self,
        page_size: usize,
    ) -> StorageResult<(Vec<T>, Option<ContinuationToken>)> {
        if page_size == 0 {
            return Ok((self.drain().await?, None));
        }

        let mut page = Vec::with_capacity(page_size.min(PAGE_RESERVE_LIMIT));
        while page.len() < page_size {
            match self.next().await? {
                Some(row) => page.push(row),
                None => return Ok((page, None)),
            }
        }

        match self.next().await {
            Ok(None) => Ok((page, None)),
            probe => {
                if let Err(e) = probe {
                    debug!(error = %e, "end-of-data probe failed, returning continuation token");
                }
                let token = page
                    .last()
                    .map(|row| ContinuationToken::from_position(row.position()));
                Ok((page, token))
            }
        }
    }

    /// Reads every remaining row.
    pub async fn collect_all(mut self) -> StorageResult<Vec<T>> {
        let result = self.drain().await;
        self.close();
        result
    }

    async fn drain(&mut self) -> StorageResult<Vec<T>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Releases the underlying cursor. Safe to call more than once.
    pub fn close(&mut self) {
        self.rows.take();
    }

    pub fn is_closed(&self) -> bool {
        self.rows.is_none()
    }
}

impl<T> Drop for TupleIterator<'_, T> {
    fn drop(&mut self) {
        self.rows.take();
    }
}
