use async_trait::async_trait;
use outbox::{CommitReceipt, EventRegistry, InMemoryOutboxStore, OutboxStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{OrderRepository, RepoError};
use crate::domain::Order;

const COLLECTION: &str = "orders";

/// Orders kept as documents next to the outbox in an [`InMemoryOutboxStore`]
pub struct InMemoryOrderRepository {
    store: InMemoryOutboxStore,
    registry: Arc<EventRegistry>,
    /// Serializes the version check with the commit
    writes: Mutex<()>,
    abort_next: AtomicBool,
}

impl InMemoryOrderRepository {
    pub fn new(store: InMemoryOutboxStore, registry: Arc<EventRegistry>) -> Self {
        Self {
            store,
            registry,
            writes: Mutex::new(()),
            abort_next: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &InMemoryOutboxStore {
        &self.store
    }

    /// Make the next save's transaction abort at commit
    pub fn abort_next_commit(&self) {
        self.abort_next.store(true, Ordering::SeqCst);
    }

    fn stored_version(&self, order_id: &str) -> Result<u32, RepoError> {
        match self.store.document(COLLECTION, order_id) {
            Some(doc) => Ok(serde_json::from_value::<Order>(doc)?.version),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn save(&self, order: &mut Order) -> Result<CommitReceipt, RepoError> {
        let _guard = self.writes.lock().await;

        if self.stored_version(&order.order_id)? != order.persisted_version() {
            return Err(RepoError::Conflict(order.order_id.clone()));
        }

        let events = order.pending();
        let records = self.registry.to_records(&events)?;

        let mut tx = self.store.begin();
        tx.put_document(COLLECTION, order.order_id.clone(), serde_json::to_value(&*order)?);
        self.store.save_all(&mut tx, &records).await?;
        if self.abort_next.swap(false, Ordering::SeqCst) {
            tx.fail_on_commit("injected abort");
        }

        let receipt = tx.commit()?;
        order.mark_persisted();
        Ok(receipt)
    }

    async fn find(&self, order_id: &str) -> Result<Option<Order>, RepoError> {
        let Some(doc) = self.store.document(COLLECTION, order_id) else {
            return Ok(None);
        };
        let mut order: Order = serde_json::from_value(doc)?;
        order.mark_persisted();
        Ok(Some(order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderLine;
    use crate::events;
    use outbox::OutboxError;

    fn repo() -> InMemoryOrderRepository {
        InMemoryOrderRepository::new(InMemoryOutboxStore::new(), Arc::new(events::registry(10)))
    }

    fn order(id: &str) -> Order {
        Order::create(
            id,
            "C-1",
            vec![OrderLine {
                sku: "SKU-1".into(),
                quantity: 1,
            }],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn save_writes_order_and_outbox_together() {
        let repo = repo();
        let mut order = order("ORD-1");

        let receipt = repo.save(&mut order).await.unwrap();

        assert_eq!(receipt.len(), 1);
        let records = repo.store().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].aggregate_id, "ORD-1");
        assert_eq!(records[0].event_id, receipt.event_ids[0]);
        assert!(repo.find("ORD-1").await.unwrap().is_some());
        assert!(!order.is_new());
    }

    #[tokio::test]
    async fn aborted_commit_leaves_nothing_behind() {
        let repo = repo();
        repo.abort_next_commit();

        let err = repo.save(&mut order("ORD-1")).await.unwrap_err();

        assert!(matches!(err, RepoError::Outbox(OutboxError::Aborted(_))));
        assert!(err.is_aborted());
        assert!(repo.find("ORD-1").await.unwrap().is_none());
        assert!(repo.store().records().is_empty());
    }

    #[tokio::test]
    async fn retry_after_abort_still_writes_the_events() {
        let repo = repo();
        let mut order = order("ORD-1");
        order.cancel(None).unwrap();

        repo.abort_next_commit();
        assert!(repo.save(&mut order).await.unwrap_err().is_aborted());
        assert_eq!(order.pending_events(), 2);
        assert!(order.is_new());

        let receipt = repo.save(&mut order).await.unwrap();

        assert_eq!(receipt.len(), 2);
        let types: Vec<_> = repo.store().records().iter().map(|r| r.event_type.clone()).collect();
        assert_eq!(types, ["wms.order.received", "wms.order.cancelled"]);
        assert_eq!(order.pending_events(), 0);
    }

    #[tokio::test]
    async fn stale_copy_is_rejected() {
        let repo = repo();
        repo.save(&mut order("ORD-1")).await.unwrap();

        let mut first = repo.find("ORD-1").await.unwrap().unwrap();
        let mut second = repo.find("ORD-1").await.unwrap().unwrap();
        first.cancel(None).unwrap();
        second.cancel(Some("late".into())).unwrap();

        repo.save(&mut first).await.unwrap();
        let err = repo.save(&mut second).await.unwrap_err();
        assert!(matches!(err, RepoError::Conflict(_)));
        assert_eq!(repo.store().records().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_id_is_a_conflict() {
        let repo = repo();
        repo.save(&mut order("ORD-1")).await.unwrap();
        let err = repo.save(&mut order("ORD-1")).await.unwrap_err();
        assert!(matches!(err, RepoError::Conflict(_)));
    }
}
