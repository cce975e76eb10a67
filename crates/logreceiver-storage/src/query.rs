//! Historical message queries.
//!
//! Pages are read in keyset batches of [`DEFAULT_BATCH_SIZE`] rows on
//! `entry_id` and filtered client-side until enough matches are collected
//! or the host's table is exhausted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use logreceiver_core::{Host, SyslogMessage};

use crate::backend::{Direction, LogBackend, PageRequest};
use crate::error::Result;

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Where a page starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// The newest row going backward, the oldest going forward
    Edge,
    /// Rows after (forward) or before (backward) this entry ID
    EntryId(i64),
    /// Rows at or after (forward), or strictly before (backward), this time
    Timestamp(DateTime<Utc>),
}

#[derive(Clone)]
pub struct MessageQuery {
    backend: Arc<dyn LogBackend>,
    batch_size: usize,
}

impl MessageQuery {
    pub fn new(backend: Arc<dyn LogBackend>) -> Self {
        Self {
            backend,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// The newest `max` matching messages, newest first.
    pub async fn latest<F>(&self, host: &Host, max: usize, predicate: F) -> Result<Vec<SyslogMessage>>
    where
        F: Fn(&SyslogMessage) -> bool,
    {
        self.page(host, Direction::Backward, Anchor::Edge, max, predicate)
            .await
    }

    /// Up to `max` matching messages from `anchor` in `direction`.
    ///
    /// Forward pages are in ascending entry ID order, backward pages in
    /// descending order.
    pub async fn page<F>(
        &self,
        host: &Host,
        direction: Direction,
        anchor: Anchor,
        max: usize,
        predicate: F,
    ) -> Result<Vec<SyslogMessage>>
    where
        F: Fn(&SyslogMessage) -> bool,
    {
        let mut matches = Vec::new();
        if max == 0 {
            return Ok(matches);
        }

        let mut request = PageRequest {
            direction,
            entry_id: None,
            timestamp: None,
            limit: self.batch_size,
        };
        match anchor {
            Anchor::Edge => {}
            Anchor::EntryId(id) => request.entry_id = Some(id),
            Anchor::Timestamp(ts) => request.timestamp = Some(ts),
        }

        loop {
            let batch = self.backend.fetch_page(host, &request).await?;
            let exhausted = batch.len() < self.batch_size;
            let last_id = batch.last().and_then(|m| m.id);

            for message in batch {
                if predicate(&message) {
                    matches.push(message);
                    if matches.len() >= max {
                        return Ok(matches);
                    }
                }
            }

            match last_id {
                Some(id) if !exhausted => request.entry_id = Some(id),
                _ => return Ok(matches),
            }
        }
    }
}
