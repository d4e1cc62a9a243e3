//! In-memory document store with outbox support
//!
//! Emulates a store with local multi-document transactions: a
//! [`MemoryTransaction`] stages aggregate documents and outbox records and
//! applies them together on [`MemoryTransaction::commit`]. Dropping the
//! transaction discards everything it staged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::{CommitReceipt, OutboxError, OutboxRecord, OutboxStats, OutboxStore};

#[derive(Debug)]
struct StoredRecord {
    seq: u64,
    record: OutboxRecord,
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: HashMap<(String, String), serde_json::Value>,
    records: Vec<StoredRecord>,
    next_seq: u64,
}

/// Shared handle; clones see the same data
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin(&self) -> MemoryTransaction {
        MemoryTransaction {
            store: self.clone(),
            documents: Vec::new(),
            records: Vec::new(),
            abort_reason: None,
        }
    }

    /// Committed document, if any
    pub fn document(&self, collection: &str, id: &str) -> Option<serde_json::Value> {
        self.lock()
            .documents
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    pub fn record(&self, event_id: Uuid) -> Option<OutboxRecord> {
        self.lock()
            .records
            .iter()
            .find(|s| s.record.event_id == event_id)
            .map(|s| s.record.clone())
    }

    /// All committed records in insertion order
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.lock().records.iter().map(|s| s.record.clone()).collect()
    }

    fn apply(&self, tx: &mut MemoryTransaction) -> Result<CommitReceipt, OutboxError> {
        let mut state = self.lock();

        let mut seen: HashSet<Uuid> = state.records.iter().map(|s| s.record.event_id).collect();
        for record in &tx.records {
            if !seen.insert(record.event_id) {
                return Err(OutboxError::DuplicateEventId(record.event_id));
            }
        }

        for (collection, id, value) in tx.documents.drain(..) {
            state.documents.insert((collection, id), value);
        }

        let mut receipt = CommitReceipt::default();
        for record in tx.records.drain(..) {
            receipt.event_ids.push(record.event_id);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.records.push(StoredRecord { seq, record });
        }

        Ok(receipt)
    }
}

/// Staged writes against an [`InMemoryOutboxStore`]
#[derive(Debug)]
pub struct MemoryTransaction {
    store: InMemoryOutboxStore,
    documents: Vec<(String, String, serde_json::Value)>,
    records: Vec<OutboxRecord>,
    abort_reason: Option<String>,
}

impl MemoryTransaction {
    pub fn put_document(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        value: serde_json::Value,
    ) {
        self.documents.push((collection.into(), id.into(), value));
    }

    /// Make the next commit fail as if the store aborted the transaction
    pub fn fail_on_commit(&mut self, reason: impl Into<String>) {
        self.abort_reason = Some(reason.into());
    }

    pub fn staged_records(&self) -> usize {
        self.records.len()
    }

    /// Apply every staged write, or none of them
    pub fn commit(mut self) -> Result<CommitReceipt, OutboxError> {
        if let Some(reason) = self.abort_reason.take() {
            return Err(OutboxError::Aborted(reason));
        }
        let store = self.store.clone();
        store.apply(&mut self)
    }
}

/// Records the relay may publish, in order, honoring per-aggregate blocking
fn eligible<'a>(
    records: impl Iterator<Item = &'a StoredRecord>,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<OutboxRecord> {
    let mut pending: Vec<&StoredRecord> = records.filter(|s| !s.record.is_published()).collect();
    pending.sort_by_key(|s| (s.record.created_at, s.seq));

    let mut blocked: HashSet<(&str, &str)> = HashSet::new();
    let mut out = Vec::new();

    for stored in pending {
        if out.len() >= limit {
            break;
        }
        let record = &stored.record;
        let key = record.aggregate_key();
        if blocked.contains(&key) {
            continue;
        }
        if record.is_poison() || !record.is_due(now) {
            blocked.insert(key);
            continue;
        }
        out.push(record.clone());
    }

    out
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    type Tx = MemoryTransaction;

    async fn save_all(
        &self,
        tx: &mut MemoryTransaction,
        records: &[OutboxRecord],
    ) -> Result<(), OutboxError> {
        tx.records.extend_from_slice(records);
        Ok(())
    }

    async fn find_unpublished(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let state = self.lock();
        Ok(eligible(state.records.iter(), Utc::now(), limit))
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<(), OutboxError> {
        let mut state = self.lock();
        let stored = state
            .records
            .iter_mut()
            .find(|s| s.record.event_id == event_id)
            .ok_or(OutboxError::NotFound(event_id))?;

        if stored.record.published_at.is_none() {
            stored.record.published_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn increment_retry(
        &self,
        event_id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32, OutboxError> {
        let mut state = self.lock();
        let stored = state
            .records
            .iter_mut()
            .find(|s| s.record.event_id == event_id)
            .ok_or(OutboxError::NotFound(event_id))?;

        let record = &mut stored.record;
        if !record.is_published() {
            record.retry_count += 1;
            record.last_error = Some(error.to_string());
            record.next_attempt_at = Some(next_attempt_at);
        }
        Ok(record.retry_count)
    }

    async fn delete_published(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError> {
        let mut state = self.lock();
        let before = state.records.len();
        state
            .records
            .retain(|s| !matches!(s.record.published_at, Some(at) if at < older_than));
        Ok((before - state.records.len()) as u64)
    }

    async fn find_poison(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let state = self.lock();
        let mut poison: Vec<&StoredRecord> =
            state.records.iter().filter(|s| s.record.is_poison()).collect();
        poison.sort_by_key(|s| (s.record.created_at, s.seq));
        Ok(poison
            .into_iter()
            .take(limit)
            .map(|s| s.record.clone())
            .collect())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let state = self.lock();
        let mut stats = OutboxStats::default();

        for stored in &state.records {
            let record = &stored.record;
            if record.is_published() {
                stats.published += 1;
                continue;
            }
            stats.backlog += 1;
            stats.total_retries += u64::from(record.retry_count);
            if record.is_poison() {
                stats.poison += 1;
            }
            stats.oldest_unpublished_at = Some(match stats.oldest_unpublished_at {
                Some(at) => at.min(record.created_at),
                None => record.created_at,
            });
        }

        Ok(stats)
    }
}
