//! Bounded registry of queue pairs.
//!
//! Each process keeps its own `FlowPool` over the same shared rings. The
//! allocating side ([`FlowPool::assign`]) picks an idle pair, resets it and
//! announces it with a SYN signal; the following side binds the announced
//! pair to its own handle with [`FlowPool::adopt`]. The registry maps are
//! behind one `RwLock`; pushing to or popping from a resolved pair never
//! touches it.
//!
//! Each process publishes its binding through the `in_use` flag of the ring
//! it produces into, and `assign` skips pairs either process still holds.

use crate::driver::Role;
use crate::error::PoolError;
use crate::flow::address::AddressPair;
use crate::shm::{RingBuffer, ShmArena};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Queue pair index inside the shared region (the dummy pair is 0)
pub type QueueId = u64;

/// Socket id on the unshaped side, stream id on the shaped side
pub type EndpointKey = u64;

/// Lifecycle of a flow as seen by one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Unassigned,
    Assigned,
    /// Half-closed: a FIN was recorded in at least one direction
    FinPending,
}

/// The two rings of one flow.
#[derive(Debug, Clone)]
pub struct QueuePair {
    id: QueueId,
    from_shaped: RingBuffer,
    to_shaped: RingBuffer,
}

impl QueuePair {
    pub fn new(id: QueueId, from_shaped: RingBuffer, to_shaped: RingBuffer) -> Self {
        Self {
            id,
            from_shaped,
            to_shaped,
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Bytes received over the shaped transport, drained onto the socket
    pub fn from_shaped(&self) -> &RingBuffer {
        &self.from_shaped
    }

    /// Bytes read from the socket, waiting for the scheduler
    pub fn to_shaped(&self) -> &RingBuffer {
        &self.to_shaped
    }

    /// Address pair stamped by the allocating side
    pub fn address(&self) -> AddressPair {
        self.to_shaped.read_address().unwrap_or_default()
    }

    pub fn stamp_address(&self, address: &AddressPair) {
        self.to_shaped.write_address(address);
    }

    /// The ring this process produces into
    fn own_ring(&self, role: Role) -> &RingBuffer {
        match role {
            Role::Unshaped => &self.to_shaped,
            Role::Shaped => &self.from_shaped,
        }
    }

    /// Either process still has the flow bound
    pub fn in_use(&self) -> bool {
        self.from_shaped.in_use() || self.to_shaped.in_use()
    }

    /// Both directions have been closed by their readers
    pub fn fully_marked(&self) -> bool {
        self.from_shaped.is_marked_for_deletion() && self.to_shaped.is_marked_for_deletion()
    }

    /// Reset rings and flags for a new flow
    fn recycle(&self) {
        self.from_shaped.clear();
        self.to_shaped.clear();
        self.from_shaped.reset_flags();
        self.to_shaped.reset_flags();
    }
}

/// Snapshot of one bound flow.
#[derive(Debug, Clone)]
pub struct FlowEntry {
    pub pair: QueuePair,
    pub endpoint: EndpointKey,
    pub state: FlowState,
}

struct Slot {
    pair: QueuePair,
    state: FlowState,
    endpoint: Option<EndpointKey>,
}

struct Registry {
    slots: Vec<Slot>,
    free: VecDeque<usize>,
    by_endpoint: HashMap<EndpointKey, usize>,
}

impl Registry {
    fn slot_index(&self, id: QueueId) -> Result<usize, PoolError> {
        let index = (id as usize).checked_sub(1).ok_or(PoolError::UnknownQueue(id))?;
        if index < self.slots.len() {
            Ok(index)
        } else {
            Err(PoolError::UnknownQueue(id))
        }
    }

    fn unbind(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if let Some(endpoint) = slot.endpoint.take() {
            self.by_endpoint.remove(&endpoint);
        }
        slot.state = FlowState::Unassigned;
    }
}

/// Pre-allocated set of `max_flows` queue pairs.
pub struct FlowPool {
    role: Role,
    registry: RwLock<Registry>,
    completed: AtomicU64,
}

impl FlowPool {
    /// Pool over every flow pair of `arena`, as seen by `role`
    pub fn new(arena: &ShmArena, role: Role) -> Self {
        let pairs = (1..=arena.max_flows())
            .filter_map(|index| {
                arena
                    .flow_pair(index)
                    .map(|(from, to)| QueuePair::new(index as QueueId, from.clone(), to.clone()))
            })
            .collect();
        Self::from_pairs(pairs, role)
    }

    /// Pool over explicit pairs; ids must be 1..=n in order
    pub fn from_pairs(pairs: Vec<QueuePair>, role: Role) -> Self {
        let slots: Vec<Slot> = pairs
            .into_iter()
            .map(|pair| Slot {
                pair,
                state: FlowState::Unassigned,
                endpoint: None,
            })
            .collect();
        let free = (0..slots.len()).collect();
        Self {
            role,
            registry: RwLock::new(Registry {
                slots,
                free,
                by_endpoint: HashMap::new(),
            }),
            completed: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the oldest idle pair for a new flow on `key`.
    ///
    /// The pair's rings are cleared and its address stamped before it is
    /// returned, so the caller can announce it immediately.
    pub fn assign(&self, key: EndpointKey, address: &AddressPair) -> Result<QueuePair, PoolError> {
        let mut registry = self.write();
        if registry.by_endpoint.contains_key(&key) {
            return Err(PoolError::InvariantViolation(format!(
                "endpoint {} is already bound to a flow",
                key
            )));
        }
        let position = registry
            .free
            .iter()
            .position(|&index| !registry.slots[index].pair.in_use())
            .ok_or(PoolError::Exhausted)?;
        let index = registry.free.remove(position).ok_or(PoolError::Exhausted)?;
        let slot = &mut registry.slots[index];
        if slot.state != FlowState::Unassigned {
            // Not reachable unless the free list is corrupt; keep the pair out of circulation
            return Err(PoolError::InvariantViolation(format!(
                "queue {} on the free list is {:?}",
                slot.pair.id(),
                slot.state
            )));
        }

        slot.pair.recycle();
        slot.pair.stamp_address(address);
        slot.pair.own_ring(self.role).set_in_use(true);
        slot.state = FlowState::Assigned;
        slot.endpoint = Some(key);
        let pair = slot.pair.clone();
        registry.by_endpoint.insert(key, index);
        debug!(queue_id = pair.id(), endpoint = key, "assigned queue pair");
        Ok(pair)
    }

    /// Bind pair `id`, announced by the other process, to the local `key`.
    ///
    /// If this process still holds an old binding for the pair (the peer
    /// recycled it before our teardown finished), the old binding is dropped.
    pub fn adopt(&self, id: QueueId, key: EndpointKey) -> Result<QueuePair, PoolError> {
        let mut registry = self.write();
        let index = registry.slot_index(id)?;
        if let Some(&other) = registry.by_endpoint.get(&key) {
            if other != index {
                return Err(PoolError::InvariantViolation(format!(
                    "endpoint {} is already bound to queue {}",
                    key,
                    other + 1
                )));
            }
        }

        if registry.slots[index].state != FlowState::Unassigned {
            warn!(
                queue_id = id,
                old_endpoint = ?registry.slots[index].endpoint,
                "queue reused by peer before local teardown; dropping stale binding"
            );
            registry.unbind(index);
        } else {
            registry.free.retain(|&free| free != index);
        }

        let slot = &mut registry.slots[index];
        slot.pair.own_ring(self.role).set_in_use(true);
        slot.state = FlowState::Assigned;
        slot.endpoint = Some(key);
        let pair = slot.pair.clone();
        registry.by_endpoint.insert(key, index);
        debug!(queue_id = id, endpoint = key, "adopted queue pair");
        Ok(pair)
    }

    /// Record a half-close; idempotent
    pub fn mark_fin_pending(&self, id: QueueId) -> Result<(), PoolError> {
        let mut registry = self.write();
        let index = registry.slot_index(id)?;
        let slot = &mut registry.slots[index];
        match slot.state {
            FlowState::Unassigned => Err(PoolError::InvariantViolation(format!(
                "FIN recorded for unassigned queue {}",
                id
            ))),
            _ => {
                slot.state = FlowState::FinPending;
                Ok(())
            }
        }
    }

    /// Return pair `id` to the idle pool.
    ///
    /// Refused unless both rings are marked for deletion. Rings are cleared
    /// on the next `assign`, not here, since the other process may still be
    /// reading.
    pub fn release(&self, id: QueueId) -> Result<(), PoolError> {
        let mut registry = self.write();
        let index = registry.slot_index(id)?;
        let slot = &registry.slots[index];
        if slot.state == FlowState::Unassigned {
            return Err(PoolError::InvariantViolation(format!(
                "release of unassigned queue {}",
                id
            )));
        }
        if !slot.pair.fully_marked() {
            return Err(PoolError::InvariantViolation(format!(
                "release of queue {} before both directions were marked for deletion",
                id
            )));
        }
        registry.unbind(index);
        registry.slots[index].pair.own_ring(self.role).set_in_use(false);
        registry.free.push_back(index);
        self.completed.fetch_add(1, Ordering::Relaxed);
        debug!(queue_id = id, "released queue pair");
        Ok(())
    }

    /// Pair `id` if it is currently bound
    pub fn find_by_queue_id(&self, id: QueueId) -> Option<QueuePair> {
        let registry = self.read();
        let index = registry.slot_index(id).ok()?;
        let slot = &registry.slots[index];
        (slot.state != FlowState::Unassigned).then(|| slot.pair.clone())
    }

    /// Pair `id` whatever its state
    pub fn pair(&self, id: QueueId) -> Option<QueuePair> {
        let registry = self.read();
        let index = registry.slot_index(id).ok()?;
        Some(registry.slots[index].pair.clone())
    }

    /// Pair bound to a socket or stream
    pub fn find_by_endpoint(&self, key: EndpointKey) -> Option<QueuePair> {
        let registry = self.read();
        registry
            .by_endpoint
            .get(&key)
            .map(|&index| registry.slots[index].pair.clone())
    }

    pub fn endpoint_of(&self, id: QueueId) -> Option<EndpointKey> {
        let registry = self.read();
        let index = registry.slot_index(id).ok()?;
        registry.slots[index].endpoint
    }

    pub fn state(&self, id: QueueId) -> Option<FlowState> {
        let registry = self.read();
        let index = registry.slot_index(id).ok()?;
        Some(registry.slots[index].state)
    }

    /// Every bound flow, in queue id order
    pub fn snapshot(&self) -> Vec<FlowEntry> {
        let registry = self.read();
        registry
            .slots
            .iter()
            .filter_map(|slot| {
                let endpoint = slot.endpoint?;
                (slot.state != FlowState::Unassigned).then(|| FlowEntry {
                    pair: slot.pair.clone(),
                    endpoint,
                    state: slot.state,
                })
            })
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.read().slots.len()
    }

    /// Idle pairs
    pub fn available(&self) -> usize {
        self.read().free.len()
    }

    /// Flows that went through a full assign/release cycle
    pub fn completed_lifecycles(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmLayout;

    fn pool(max_flows: usize) -> (ShmArena, FlowPool) {
        let arena = ShmArena::in_memory(ShmLayout::new(max_flows, 256).unwrap()).unwrap();
        let pool = FlowPool::new(&arena, Role::Unshaped);
        (arena, pool)
    }

    fn address() -> AddressPair {
        AddressPair::from_endpoints("127.0.0.1:40000", "127.0.0.1:8080").unwrap()
    }

    fn close_both(pair: &QueuePair) {
        pair.from_shaped().mark_for_deletion();
        pair.to_shaped().mark_for_deletion();
    }

    #[test]
    fn test_assign_hands_out_fifo_order() {
        let (_arena, pool) = pool(3);
        assert_eq!(pool.capacity(), 3);
        let a = pool.assign(10, &address()).unwrap();
        let b = pool.assign(11, &address()).unwrap();
        assert_eq!((a.id(), b.id()), (1, 2));
        assert_eq!(pool.available(), 1);

        close_both(&a);
        pool.release(a.id()).unwrap();
        let c = pool.assign(12, &address()).unwrap();
        // Pair 3 was idle longer than the just-released pair 1
        assert_eq!(c.id(), 3);
        let d = pool.assign(13, &address()).unwrap();
        assert_eq!(d.id(), 1);
    }

    #[test]
    fn test_exhaustion_leaves_existing_flow_untouched() {
        let (_arena, pool) = pool(1);
        let first = pool.assign(1, &address()).unwrap();
        first.to_shaped().push(b"in flight").unwrap();

        assert_eq!(pool.assign(2, &address()).unwrap_err(), PoolError::Exhausted);
        assert_eq!(pool.find_by_endpoint(1).map(|p| p.id()), Some(first.id()));
        assert_eq!(first.to_shaped().size(), 9);
        assert!(pool.find_by_endpoint(2).is_none());
    }

    #[test]
    fn test_release_requires_both_directions_marked() {
        let (_arena, pool) = pool(1);
        let pair = pool.assign(7, &address()).unwrap();

        pair.to_shaped().mark_for_deletion();
        assert!(matches!(pool.release(pair.id()), Err(PoolError::InvariantViolation(_))));
        assert_eq!(pool.state(pair.id()), Some(FlowState::Assigned));
        assert_eq!(pool.available(), 0);

        pair.from_shaped().mark_for_deletion();
        pool.release(pair.id()).unwrap();
        assert_eq!(pool.state(pair.id()), Some(FlowState::Unassigned));
        assert_eq!(pool.available(), 1);
        assert!(pool.find_by_endpoint(7).is_none());
    }

    #[test]
    fn test_release_of_unassigned_pair_is_refused() {
        let (_arena, pool) = pool(2);
        assert!(matches!(pool.release(1), Err(PoolError::InvariantViolation(_))));
        assert_eq!(pool.release(9), Err(PoolError::UnknownQueue(9)));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_assign_recycles_rings_and_stamps_address() {
        let (_arena, pool) = pool(1);
        let pair = pool.assign(1, &address()).unwrap();
        pair.to_shaped().push(b"leftover").unwrap();
        pair.to_shaped().set_sent_fin();
        close_both(&pair);
        pool.release(pair.id()).unwrap();

        let next = AddressPair::from_endpoints("10.1.1.1:1", "10.2.2.2:2").unwrap();
        let again = pool.assign(2, &next).unwrap();
        assert_eq!(again.id(), pair.id());
        assert!(again.to_shaped().is_empty());
        assert!(!again.to_shaped().sent_fin());
        assert!(!again.fully_marked());
        assert_eq!(again.address(), next);
    }

    #[test]
    fn test_endpoint_cannot_bind_twice() {
        let (_arena, pool) = pool(2);
        pool.assign(5, &address()).unwrap();
        assert!(matches!(pool.assign(5, &address()), Err(PoolError::InvariantViolation(_))));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_adopt_binds_announced_pair() {
        let (arena, allocator) = pool(2);
        let follower = FlowPool::new(&arena, Role::Shaped);

        let pair = allocator.assign(100, &address()).unwrap();
        let adopted = follower.adopt(pair.id(), 900).unwrap();
        assert_eq!(adopted.id(), pair.id());
        assert_eq!(adopted.address(), address());
        assert_eq!(follower.endpoint_of(pair.id()), Some(900));
        assert_eq!(follower.available(), 1);
    }

    #[test]
    fn test_pair_held_by_peer_is_not_reassigned() {
        let (arena, allocator) = pool(1);
        let follower = FlowPool::new(&arena, Role::Shaped);

        let pair = allocator.assign(1, &address()).unwrap();
        follower.adopt(pair.id(), 77).unwrap();
        close_both(&pair);
        allocator.release(pair.id()).unwrap();
        assert!(pair.in_use());

        // The follower has not let go yet
        assert_eq!(allocator.assign(2, &address()).unwrap_err(), PoolError::Exhausted);
        assert_eq!(allocator.available(), 1);

        follower.release(pair.id()).unwrap();
        assert!(!pair.in_use());
        assert_eq!(allocator.assign(2, &address()).unwrap().id(), pair.id());
    }

    #[test]
    fn test_adopt_replaces_stale_binding() {
        let (_arena, pool) = pool(1);
        pool.adopt(1, 50).unwrap();
        pool.adopt(1, 51).unwrap();
        assert!(pool.find_by_endpoint(50).is_none());
        assert_eq!(pool.find_by_endpoint(51).map(|p| p.id()), Some(1));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_fin_pending_transition() {
        let (_arena, pool) = pool(1);
        assert!(pool.mark_fin_pending(1).is_err());
        let pair = pool.assign(1, &address()).unwrap();
        pool.mark_fin_pending(pair.id()).unwrap();
        pool.mark_fin_pending(pair.id()).unwrap();
        assert_eq!(pool.state(pair.id()), Some(FlowState::FinPending));
        assert_eq!(pool.snapshot()[0].state, FlowState::FinPending);
    }

    #[test]
    fn test_each_connection_completes_exactly_once() {
        let (_arena, pool) = pool(2);
        for key in 0..10u64 {
            let pair = pool.assign(key, &address()).unwrap();
            assert!(pool.snapshot().iter().all(|entry| entry.endpoint == key));
            pool.mark_fin_pending(pair.id()).unwrap();
            close_both(&pair);
            pool.release(pair.id()).unwrap();
            assert!(pool.release(pair.id()).is_err());
        }
        assert_eq!(pool.completed_lifecycles(), 10);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_never_hands_out_pair_in_use() {
        let (_arena, pool) = pool(4);
        let mut live = Vec::new();
        for key in 0..4u64 {
            live.push(pool.assign(key, &address()).unwrap().id());
        }
        live.sort_unstable();
        live.dedup();
        assert_eq!(live.len(), 4);
        assert_eq!(pool.assign(99, &address()).unwrap_err(), PoolError::Exhausted);
    }
}
