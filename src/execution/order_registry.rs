use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::RegistryError;
use crate::models::{Order, OrderId, OrderKind, OrderStatus};

/// A status change applied by `reconcile`
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub order_id: OrderId,
    pub kind: OrderKind,
    pub previous: OrderStatus,
    pub current: OrderStatus,
}

/// Shared view of every order submitted this session
///
/// Cloning is cheap; all clones see the same orders. Readers (poller,
/// status report) may run alongside the single writer.
#[derive(Clone, Default)]
pub struct OrderRegistry {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
}

impl OrderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<OrderId, Order>> {
        self.orders.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<OrderId, Order>> {
        self.orders.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking a submitted order
    pub fn register(&self, order: Order) -> Result<(), RegistryError> {
        let mut orders = self.write();
        if orders.contains_key(&order.id) {
            return Err(RegistryError::Duplicate(order.id));
        }

        tracing::debug!(order_id = %order.id, kind = %order.kind, "Registered order");
        orders.insert(order.id, order);
        Ok(())
    }

    /// Apply a remote status
    ///
    /// Returns the change, or `None` when nothing changed. Terminal orders
    /// keep their final status.
    pub fn reconcile(
        &self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<Option<StatusChange>, RegistryError> {
        let mut orders = self.write();
        let order = orders
            .get_mut(&order_id)
            .ok_or(RegistryError::Unknown(order_id))?;

        if order.status == status {
            return Ok(None);
        }
        if order.status.is_terminal() {
            tracing::warn!(
                order_id = %order_id,
                current = %order.status,
                reported = %status,
                "Ignoring status change on terminal order"
            );
            return Ok(None);
        }

        let change = StatusChange {
            order_id,
            kind: order.kind,
            previous: order.status,
            current: status,
        };
        order.status = status;
        order.updated_at = Utc::now();

        Ok(Some(change))
    }

    pub fn get(&self, order_id: OrderId) -> Option<Order> {
        self.read().get(&order_id).cloned()
    }

    pub fn status(&self, order_id: OrderId) -> Option<OrderStatus> {
        self.read().get(&order_id).map(|o| o.status)
    }

    /// Ids of orders not yet FILLED, CANCELED or REJECTED
    pub fn in_flight(&self) -> Vec<OrderId> {
        let mut ids: Vec<OrderId> = self
            .read()
            .values()
            .filter(|o| !o.status.is_terminal())
            .map(|o| o.id)
            .collect();
        ids.sort();
        ids
    }

    /// All orders, oldest first
    pub fn snapshot(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.read().values().cloned().collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        orders
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
