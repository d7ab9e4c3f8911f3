//! Lazy, forward-only result sets

use crate::context::RequestContext;
use crate::errors::{BridgeError, Result};
use crate::query::executor::{cancel_upstream, classify};
use crate::warehouse::{ColumnDescriptor, Row, RowCursor, UpstreamCancel};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Fully drained result, bounded by the row cap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub truncated: bool,
}

/// Rows of one statement, pulled batch by batch
///
/// Not restartable. Once the cap is reached or the portal is exhausted the
/// cursor is closed and further calls return `None`.
pub struct ResultSet<'c> {
    cursor: Option<Box<dyn RowCursor + 'c>>,
    cancel: Box<dyn UpstreamCancel>,
    columns: Vec<ColumnDescriptor>,
    ctx: RequestContext,
    deadline: Option<Instant>,
    statement_timeout: Option<Duration>,
    row_cap: usize,
    batch_size: usize,
    delivered: usize,
    truncated: bool,
}

impl<'c> ResultSet<'c> {
    pub(crate) fn new(
        cursor: Box<dyn RowCursor + 'c>,
        cancel: Box<dyn UpstreamCancel>,
        ctx: RequestContext,
        deadline: Option<Instant>,
        statement_timeout: Option<Duration>,
        row_cap: usize,
        batch_size: usize,
    ) -> Self {
        let columns = cursor.columns().to_vec();
        Self {
            cursor: Some(cursor),
            cancel,
            columns,
            ctx,
            deadline,
            statement_timeout,
            row_cap,
            batch_size,
            delivered: 0,
            truncated: false,
        }
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Rows handed out so far
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Whether the row cap stopped the result early
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_finished(&self) -> bool {
        self.cursor.is_none()
    }

    /// Pull the next batch; `None` once the result is finished
    ///
    /// One more row than the remaining cap is requested so truncation is
    /// detected without an extra round-trip.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };

        let remaining = self.row_cap - self.delivered;
        let want = self.batch_size.min(remaining + 1);

        let fetched = self.ctx.guard(self.deadline, cursor.fetch(want)).await;
        let mut rows = match fetched {
            Ok(rows) => rows,
            Err(err) => return Err(self.abort(err).await),
        };

        let exhausted = rows.len() < want;
        if rows.len() > remaining {
            rows.truncate(remaining);
            self.truncated = true;
        }
        self.delivered += rows.len();

        if exhausted || self.truncated {
            self.finish().await?;
        }

        if rows.is_empty() && self.is_finished() {
            Ok(None)
        } else {
            Ok(Some(rows))
        }
    }

    /// Drain every remaining batch
    pub async fn collect(mut self) -> Result<QueryOutput> {
        let mut rows = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            rows.extend(batch);
        }
        Ok(QueryOutput {
            columns: std::mem::take(&mut self.columns),
            row_count: rows.len(),
            rows,
            truncated: self.truncated,
        })
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(cursor) = self.cursor.take() {
            let closed = self.ctx.guard(self.deadline, cursor.close()).await;
            if let Err(err) = closed {
                return Err(self.abort(err).await);
            }
            tracing::debug!(
                request_id = %self.ctx.id(),
                rows = self.delivered,
                truncated = self.truncated,
                "statement finished"
            );
        }
        Ok(())
    }

    async fn abort(&mut self, err: BridgeError) -> BridgeError {
        self.cursor.take();
        let err = classify(err, &self.ctx, self.deadline, self.statement_timeout);
        if matches!(err, BridgeError::Cancelled | BridgeError::Timeout { .. }) {
            cancel_upstream(self.cancel.as_ref(), &self.ctx).await;
        }
        tracing::debug!(request_id = %self.ctx.id(), error = %err, "statement aborted");
        err
    }
}
