//! Device inventory of one resource and fan-out to its watchers.
//!
//! The inventory and the set of subscribers live behind one mutex. Every
//! mutation publishes the new inventory to each subscriber while the lock is
//! held, so all watchers observe the same sequence of states in the order
//! they were produced, and a watcher attaching concurrently with an update
//! sees either the old state followed by the update or the new state alone.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use tokio::sync::mpsc;
use tracing::debug;

use crate::device::DeviceHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    /// Wire representation used by the device plugin API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "Healthy",
            Self::Unhealthy => "Unhealthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub identity: DeviceHandle,
    pub health: Health,
}

impl DeviceRecord {
    pub fn healthy(identity: DeviceHandle) -> Self {
        Self {
            identity,
            health: Health::Healthy,
        }
    }
}

/// Devices advertised for one resource, unique by identity and ordered by it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    devices: BTreeMap<DeviceHandle, Health>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record. Returns whether the inventory changed.
    pub fn upsert(&mut self, record: DeviceRecord) -> bool {
        self.devices.insert(record.identity, record.health) != Some(record.health)
    }

    /// Returns whether the device was present.
    pub fn remove(&mut self, identity: &DeviceHandle) -> bool {
        self.devices.remove(identity).is_some()
    }

    pub fn health(&self, identity: &DeviceHandle) -> Option<Health> {
        self.devices.get(identity).copied()
    }

    pub fn records(&self) -> impl Iterator<Item = DeviceRecord> + '_ {
        self.devices.iter().map(|(identity, health)| DeviceRecord {
            identity: identity.clone(),
            health: *health,
        })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl FromIterator<DeviceRecord> for Inventory {
    fn from_iter<T: IntoIterator<Item = DeviceRecord>>(iter: T) -> Self {
        Self {
            devices: iter
                .into_iter()
                .map(|record| (record.identity, record.health))
                .collect(),
        }
    }
}

#[derive(Default)]
struct HubState {
    inventory: Inventory,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Inventory>>,
    next_id: u64,
    closed: bool,
}

impl HubState {
    fn publish(&mut self) {
        let inventory = &self.inventory;
        self.subscribers
            .retain(|_, subscriber| subscriber.send(inventory.clone()).is_ok());
    }
}

/// Shared inventory of one resource plus its live subscriptions.
#[derive(Clone, Default)]
pub struct InventoryHub {
    state: Arc<Mutex<HubState>>,
}

impl InventoryHub {
    pub fn new(inventory: Inventory) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                inventory,
                ..HubState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Inventory {
        self.lock().inventory.clone()
    }

    /// Attach a watcher. The current inventory is queued as its first item.
    ///
    /// Subscribing to a closed hub yields a subscription that ends immediately.
    pub fn subscribe(&self) -> Subscription {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        if !state.closed && tx.send(state.inventory.clone()).is_ok() {
            state.subscribers.insert(id, tx);
        }
        debug!(subscription = id, "watcher subscribed");

        Subscription {
            id,
            receiver: rx,
            hub: Arc::downgrade(&self.state),
        }
    }

    /// Replace the whole inventory. Watchers are only notified when it differs.
    pub fn replace(&self, inventory: Inventory) -> bool {
        self.update(|current| {
            if *current == inventory {
                return false;
            }
            *current = inventory;
            true
        })
    }

    /// Mutate the inventory in place; `f` reports whether it changed anything.
    pub fn update(&self, f: impl FnOnce(&mut Inventory) -> bool) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let changed = f(&mut state.inventory);
        if changed {
            state.publish();
        }
        changed
    }

    /// End every subscription and refuse further updates.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// One watcher's stream of inventory snapshots. Dropping it detaches the watcher.
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<Inventory>,
    hub: Weak<Mutex<HubState>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next snapshot, or `None` once the hub has been closed.
    pub async fn next(&mut self) -> Option<Inventory> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.hub.upgrade() {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.subscribers.remove(&self.id).is_some() {
                debug!(subscription = self.id, "watcher unsubscribed");
            }
        }
    }
}
