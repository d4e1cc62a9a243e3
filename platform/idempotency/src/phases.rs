//! Recovery checkpoints for handlers with several side-effecting steps
//!
//! A handler behind the gate finds a [`PhaseTracker`] in its request
//! extensions. After each step it calls [`PhaseTracker::checkpoint`]; when
//! the execution fails or dies and the client retries the same request,
//! [`PhaseTracker::should_skip`] reports the steps already done.
//!
//! ```ignore
//! async fn create_order(tracker: Option<Extension<PhaseTracker>>, ..) -> .. {
//!     let mut phases = tracker.map(|Extension(t)| t.with_phases(&["stock_reserved", "order_saved"]));
//!     if !phases.as_ref().is_some_and(|p| p.should_skip("stock_reserved")) {
//!         reserve_stock().await?;
//!         if let Some(p) = phases.as_mut() {
//!             p.checkpoint("stock_reserved").await?;
//!         }
//!     }
//!     ..
//! }
//! ```

use std::sync::Arc;

use crate::{IdempotencyError, KeyLease, KeyStore};

#[derive(Clone)]
pub struct PhaseTracker {
    store: Arc<dyn KeyStore>,
    lease: KeyLease,
    recovery_point: Option<String>,
    order: &'static [&'static str],
}

impl PhaseTracker {
    pub fn new(store: Arc<dyn KeyStore>, lease: KeyLease) -> Self {
        let recovery_point = lease.recovery_point.clone();
        Self {
            store,
            lease,
            recovery_point,
            order: &[],
        }
    }

    /// Declare the handler's phases in execution order, so every phase up to
    /// the recovery point counts as done. Without it only the recovery point
    /// itself is skipped.
    pub fn with_phases(mut self, order: &'static [&'static str]) -> Self {
        self.order = order;
        self
    }

    pub fn key(&self) -> &str {
        &self.lease.key
    }

    /// Last phase checkpointed for this request, by this or an earlier attempt
    pub fn recovery_point(&self) -> Option<&str> {
        self.recovery_point.as_deref()
    }

    pub fn should_skip(&self, phase: &str) -> bool {
        let Some(reached) = self.recovery_point.as_deref() else {
            return false;
        };
        let position = |name: &str| self.order.iter().position(|p| *p == name);
        match (position(phase), position(reached)) {
            (Some(phase), Some(reached)) => phase <= reached,
            _ => phase == reached,
        }
    }

    /// Persist `phase` as done. Fails with `LeaseLost` once another
    /// execution has taken the key over.
    pub async fn checkpoint(&mut self, phase: &str) -> Result<(), IdempotencyError> {
        self.store.set_recovery_point(&self.lease, phase).await?;
        tracing::debug!(key = %self.lease.key, phase = %phase, "Recovery checkpoint set");
        self.recovery_point = Some(phase.to_string());
        Ok(())
    }
}
