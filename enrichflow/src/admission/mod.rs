//! Work-in-progress limits per stage.
//!
//! WIP is counted from the item store (items held at the stage's working
//! status), never from in-process state, so every orchestrator process
//! sees the same picture. Parked items whose `retry_after` has passed
//! are due for re-claim and do not occupy WIP slots.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::EngineError;
use crate::status::StatusCode;
use crate::store::ItemStore;

/// Fallback WIP limit for stages without an explicit entry.
pub const DEFAULT_WIP_LIMIT: usize = 10;

/// Per-stage concurrency limits.
#[derive(Debug, Clone)]
pub struct WipLimits {
    limits: HashMap<String, usize>,
    default_limit: usize,
}

impl Default for WipLimits {
    fn default() -> Self {
        Self {
            limits: HashMap::new(),
            default_limit: DEFAULT_WIP_LIMIT,
        }
    }
}

impl WipLimits {
    /// Creates limits with the builtin default fallback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the limit for one stage.
    #[must_use]
    pub fn with_limit(mut self, stage: impl Into<String>, limit: usize) -> Self {
        self.limits.insert(stage.into(), limit);
        self
    }

    /// Sets the fallback for stages without an explicit entry.
    #[must_use]
    pub fn with_default(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    /// The limit for a stage.
    #[must_use]
    pub fn limit_for(&self, stage: &str) -> usize {
        self.limits.get(stage).copied().unwrap_or(self.default_limit)
    }
}

/// A stage's concurrency headroom at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WipCapacity {
    /// Configured limit.
    pub limit: usize,
    /// Items currently in flight at the working status.
    pub current: usize,
    /// Claimable slots (`limit - current`, floored at zero).
    pub available: usize,
}

/// Gates batch claims on per-stage WIP limits.
#[derive(Clone)]
pub struct AdmissionController {
    items: Arc<dyn ItemStore>,
    limits: WipLimits,
}

impl AdmissionController {
    /// Creates a controller over an item store.
    #[must_use]
    pub fn new(items: Arc<dyn ItemStore>, limits: WipLimits) -> Self {
        Self { items, limits }
    }

    /// The configured limits.
    #[must_use]
    pub fn limits(&self) -> &WipLimits {
        &self.limits
    }

    /// Items currently in flight at a stage's working status.
    ///
    /// Due-parked items (with a passed `retry_after`) are excluded: they
    /// wait to be re-claimed and must not block the claim that would
    /// retry them.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Infrastructure`] when the store fails.
    pub async fn current_wip(
        &self,
        working: StatusCode,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        Ok(self.items.count_in_flight(working, now).await?)
    }

    /// The stage's capacity triple, consulted before claiming a batch.
    ///
    /// Oversubscription can still happen transiently when two processes
    /// check at the same time; limits here bound steady-state load, the
    /// idempotency layer handles the races.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Infrastructure`] when the store fails.
    pub async fn capacity(
        &self,
        stage: &str,
        working: StatusCode,
        now: DateTime<Utc>,
    ) -> Result<WipCapacity, EngineError> {
        let limit = self.limits.limit_for(stage);
        let current = self.current_wip(working, now).await?;
        Ok(WipCapacity {
            limit,
            current,
            available: limit.saturating_sub(current),
        })
    }

    /// True when the stage has at least one claimable slot.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Infrastructure`] when the store fails.
    pub async fn has_capacity(
        &self,
        stage: &str,
        working: StatusCode,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        Ok(self.capacity(stage, working, now).await?.available > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkItem;
    use crate::store::InMemoryItemStore;
    use pretty_assertions::assert_eq;

    const SUMMARIZING: StatusCode = StatusCode(211);

    async fn store_with_working(n: usize) -> Arc<InMemoryItemStore> {
        let store = Arc::new(InMemoryItemStore::new());
        for _ in 0..n {
            store
                .insert(WorkItem::new(SUMMARIZING, "rss"))
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn test_unknown_stage_gets_default_limit() {
        let limits = WipLimits::new().with_limit("summarize", 3);
        assert_eq!(limits.limit_for("summarize"), 3);
        assert_eq!(limits.limit_for("thumbnail"), DEFAULT_WIP_LIMIT);
        assert_eq!(
            WipLimits::new().with_default(2).limit_for("anything"),
            2
        );
    }

    #[tokio::test]
    async fn test_capacity_triple() {
        let store = store_with_working(4).await;
        let controller =
            AdmissionController::new(store, WipLimits::new().with_limit("summarize", 6));
        let capacity = controller
            .capacity("summarize", SUMMARIZING, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            capacity,
            WipCapacity {
                limit: 6,
                current: 4,
                available: 2
            }
        );
    }

    #[tokio::test]
    async fn test_capacity_floors_at_zero_when_over_limit() {
        let store = store_with_working(5).await;
        let controller =
            AdmissionController::new(store, WipLimits::new().with_limit("summarize", 3));
        let capacity = controller
            .capacity("summarize", SUMMARIZING, Utc::now())
            .await
            .unwrap();
        assert_eq!(capacity.available, 0);
        assert_eq!(capacity.current, 5);
    }

    #[tokio::test]
    async fn test_other_statuses_do_not_count() {
        let store = store_with_working(1).await;
        store
            .insert(WorkItem::new(StatusCode(210), "rss"))
            .await
            .unwrap();
        let controller = AdmissionController::new(store, WipLimits::new());
        assert_eq!(
            controller.current_wip(SUMMARIZING, Utc::now()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_due_parked_items_free_their_slots() {
        let store = store_with_working(2).await;
        let mut due = WorkItem::new(SUMMARIZING, "rss");
        due.retry_after = Some(Utc::now() - chrono::Duration::seconds(10));
        store.insert(due).await.unwrap();

        let controller =
            AdmissionController::new(store, WipLimits::new().with_limit("summarize", 3));
        let capacity = controller
            .capacity("summarize", SUMMARIZING, Utc::now())
            .await
            .unwrap();
        assert_eq!(capacity.current, 2);
        assert_eq!(capacity.available, 1);
        assert!(controller
            .has_capacity("summarize", SUMMARIZING, Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_has_capacity_false_at_limit() {
        let store = store_with_working(2).await;
        let controller =
            AdmissionController::new(store, WipLimits::new().with_limit("summarize", 2));
        assert!(!controller
            .has_capacity("summarize", SUMMARIZING, Utc::now())
            .await
            .unwrap());
    }
}
