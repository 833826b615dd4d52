use std::time::Duration;

use crate::error::GuardError;
use crate::types::{ResourceCategory, ResourceQuantity, ResourceTypeId};

/// One registered resource type.
///
/// Owned by the manager once registered; `allocated` is mutated only through
/// the manager's grant and release paths. Queries hand out value copies.
#[derive(Clone, Debug)]
pub struct Resource {
    id: ResourceTypeId,
    name: String,
    category: ResourceCategory,
    total_capacity: ResourceQuantity,
    allocated: ResourceQuantity,
    replenish_interval: Option<Duration>,
    cost_per_unit: Option<f64>,
}

impl Resource {
    /// Creates a resource with the given capacity.
    ///
    /// Leave `id` at 0 to have the manager assign one on registration.
    pub fn new(
        id: ResourceTypeId,
        name: impl Into<String>,
        category: ResourceCategory,
        total_capacity: ResourceQuantity,
    ) -> Result<Self, GuardError> {
        if total_capacity < 0 {
            return Err(GuardError::InvalidCapacity {
                capacity: total_capacity,
            });
        }
        Ok(Self {
            id,
            name: name.into(),
            category,
            total_capacity,
            allocated: 0,
            replenish_interval: None,
            cost_per_unit: None,
        })
    }

    pub fn id(&self) -> ResourceTypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> ResourceCategory {
        self.category
    }

    pub fn total_capacity(&self) -> ResourceQuantity {
        self.total_capacity
    }

    pub fn allocated(&self) -> ResourceQuantity {
        self.allocated
    }

    pub fn available(&self) -> ResourceQuantity {
        self.total_capacity - self.allocated
    }

    /// Adjusts total capacity. Fails when the new capacity would fall below
    /// what is currently allocated.
    pub fn set_total_capacity(&mut self, new_capacity: ResourceQuantity) -> bool {
        if new_capacity < self.allocated {
            return false;
        }
        self.total_capacity = new_capacity;
        true
    }

    pub fn set_replenish_interval(&mut self, interval: Duration) {
        self.replenish_interval = Some(interval);
    }

    pub fn replenish_interval(&self) -> Option<Duration> {
        self.replenish_interval
    }

    pub fn set_cost_per_unit(&mut self, cost: f64) {
        self.cost_per_unit = Some(cost);
    }

    pub fn cost_per_unit(&self) -> Option<f64> {
        self.cost_per_unit
    }

    pub(crate) fn set_id(&mut self, id: ResourceTypeId) {
        self.id = id;
    }

    pub(crate) fn allocate(&mut self, qty: ResourceQuantity) {
        self.allocated += qty;
    }

    pub(crate) fn deallocate(&mut self, qty: ResourceQuantity) {
        self.allocated -= qty;
        if self.allocated < 0 {
            self.allocated = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: ResourceQuantity) -> Resource {
        Resource::new(1, "gpu", ResourceCategory::GpuCompute, capacity).unwrap()
    }

    #[test]
    fn negative_capacity_is_rejected() {
        let result = Resource::new(1, "bad", ResourceCategory::Custom, -1);
        assert!(matches!(result, Err(GuardError::InvalidCapacity { capacity: -1 })));
    }

    #[test]
    fn available_tracks_allocation() {
        let mut r = pool(10);
        assert_eq!(r.available(), 10);
        r.allocate(4);
        assert_eq!(r.allocated(), 4);
        assert_eq!(r.available(), 6);
        r.deallocate(4);
        assert_eq!(r.available(), 10);
    }

    #[test]
    fn deallocate_floors_at_zero() {
        let mut r = pool(10);
        r.allocate(2);
        r.deallocate(5);
        assert_eq!(r.allocated(), 0);
    }

    #[test]
    fn capacity_cannot_drop_below_allocated() {
        let mut r = pool(10);
        r.allocate(6);
        assert!(!r.set_total_capacity(5));
        assert_eq!(r.total_capacity(), 10);
        assert!(r.set_total_capacity(6));
        assert_eq!(r.available(), 0);
    }
}
