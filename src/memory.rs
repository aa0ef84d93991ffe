//! Quantum memory: a fixed array of addressable qubit slots.
//!
//! Each slot owns a [`MemoryQubit`] (lifecycle state, channel and path
//! allocation, reservation key) and optionally one stored [`Entanglement`].
//! Writing a pair schedules its decoherence event; destructive reading cancels
//! it and applies the storage error model for the elapsed time. When a
//! decoherence event fires while the pair is still stored, the slot is freed
//! and the link layer is notified so generation can restart.

use std::collections::BTreeMap;

use tracing::warn;

use crate::epr::Entanglement;
use crate::event::CancelToken;
use crate::network::NetEvent;
use crate::simulator::Simulator;
use crate::time::Time;
use crate::{NodeId, PathId, QChannelId};

/// Lifecycle state of a memory qubit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QubitState {
    /// Slot is free (holds no pair).
    Release,
    /// A pair was written; the forwarder has not yet processed the notification.
    Entangled,
    /// Undergoing (or awaiting) purification rounds.
    Purif,
    /// Kept half of an in-flight purification exchange.
    Pending,
    /// Completed purification; ready to swap or be consumed.
    Eligible,
}

/// Which side of the path this slot serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathDirection {
    /// Entanglements toward the previous hop.
    Left,
    /// Entanglements toward the next hop.
    Right,
}

/// An addressable qubit slot with a lifecycle.
#[derive(Debug)]
pub struct MemoryQubit {
    /// Stable slot index.
    pub addr: usize,
    state: QubitState,
    /// Quantum channel this slot is assigned to.
    pub qchannel: Option<QChannelId>,
    /// Routing path this slot is allocated to.
    pub path_id: Option<PathId>,
    pub path_direction: Option<PathDirection>,
    /// Purification rounds completed on the current pair.
    pub purif_rounds: u32,
    /// Reservation key while a generation attempt is in flight.
    pub active: Option<String>,
}

impl MemoryQubit {
    fn new(addr: usize) -> Self {
        Self {
            addr,
            state: QubitState::Release,
            qchannel: None,
            path_id: None,
            path_direction: None,
            purif_rounds: 0,
            active: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> QubitState {
        self.state
    }

    pub fn to_entangled(&mut self) {
        self.transition(QubitState::Entangled, &[QubitState::Release]);
    }

    pub fn to_purif(&mut self) {
        self.transition(
            QubitState::Purif,
            &[QubitState::Entangled, QubitState::Pending, QubitState::Purif],
        );
    }

    pub fn to_pending(&mut self) {
        self.transition(QubitState::Pending, &[QubitState::Purif]);
    }

    pub fn to_eligible(&mut self) {
        self.transition(QubitState::Eligible, &[QubitState::Purif]);
    }

    pub fn to_release(&mut self) {
        self.state = QubitState::Release;
    }

    fn transition(&mut self, to: QubitState, allowed_from: &[QubitState]) {
        if !allowed_from.contains(&self.state) {
            warn!(addr = self.addr, "unexpected transition {:?} -> {to:?}", self.state);
        }
        self.state = to;
    }
}

/// Lookup key: a slot address or a pair name.
#[derive(Debug, Clone, Copy)]
pub enum MemKey<'a> {
    Addr(usize),
    Name(&'a str),
}

impl From<usize> for MemKey<'_> {
    fn from(addr: usize) -> Self {
        MemKey::Addr(addr)
    }
}

impl<'a> From<&'a str> for MemKey<'a> {
    fn from(name: &'a str) -> Self {
        MemKey::Name(name)
    }
}

#[derive(Debug)]
struct Slot {
    qubit: MemoryQubit,
    pair: Option<Entanglement>,
    store_time: Option<Time>,
}

/// Filters for selecting the slot of a write.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFilter<'a> {
    /// Only slots allocated to this path.
    pub path_id: Option<PathId>,
    /// Only this slot address.
    pub address: Option<usize>,
    /// Only the slot reserved under this key.
    pub key: Option<&'a str>,
    /// Store-time alignment: the pair is considered stored `delay` seconds ago.
    pub delay: f64,
}

/// Fixed-capacity quantum memory of one node.
#[derive(Debug)]
pub struct QuantumMemory {
    node: NodeId,
    capacity: usize,
    decoherence_rate: f64,
    slots: Vec<Slot>,
    usage: usize,
    pending_decohere: BTreeMap<String, CancelToken>,
}

impl QuantumMemory {
    /// Memory with `capacity` slots. `decoherence_rate` is per second; zero
    /// disables scheduled decoherence.
    #[must_use]
    pub fn new(node: NodeId, capacity: usize, decoherence_rate: f64) -> Self {
        let slots = (0..capacity)
            .map(|addr| Slot {
                qubit: MemoryQubit::new(addr),
                pair: None,
                store_time: None,
            })
            .collect();
        Self {
            node,
            capacity,
            decoherence_rate,
            slots,
            usage: 0,
            pending_decohere: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn decoherence_rate(&self) -> f64 {
        self.decoherence_rate
    }

    /// Stored pair count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.usage
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.capacity > 0 && self.usage >= self.capacity
    }

    fn index_of(&self, key: MemKey<'_>) -> Option<usize> {
        match key {
            MemKey::Addr(addr) => (addr < self.slots.len()).then_some(addr),
            MemKey::Name(name) => self
                .slots
                .iter()
                .position(|s| s.pair.as_ref().is_some_and(|p| p.name == name)),
        }
    }

    /// Store a pair into a free slot matching the filter. Returns the slot
    /// address, or `None` when the memory is full or no slot matches.
    ///
    /// The pair's decoherence deadline is kept if already set (the far half of
    /// an elementary pair carries the primary side's deadline); otherwise it
    /// is derived from the aligned store time. A decoherence event is
    /// scheduled at that deadline.
    pub fn write(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        pair: &mut Entanglement,
        filter: WriteFilter<'_>,
    ) -> Option<usize> {
        if self.is_full() {
            return None;
        }

        let idx = self.slots.iter().position(|s| {
            s.pair.is_none()
                && filter.key.map_or(true, |k| s.qubit.active.as_deref() == Some(k))
                && filter.path_id.map_or(true, |p| s.qubit.path_id == Some(p))
                && filter.address.map_or(true, |a| s.qubit.addr == a)
        })?;

        let store_time = sim.tc() - sim.time(filter.delay);
        if pair.decoherence_time.is_none() && self.decoherence_rate > 0.0 {
            pair.decoherence_time = Some(store_time + sim.time(1.0 / self.decoherence_rate));
        }

        if let Some(deadline) = pair.decoherence_time {
            let token = sim.schedule(
                deadline,
                NetEvent::MemoryDecohere {
                    node: self.node,
                    addr: idx,
                    pair: pair.name.clone(),
                },
            );
            self.pending_decohere.insert(pair.name.clone(), token);
        }

        self.slots[idx].pair = Some(pair.clone());
        self.slots[idx].store_time = Some(store_time);
        self.usage += 1;
        Some(idx)
    }

    /// Read a stored pair.
    ///
    /// Destructive reads clear the slot, cancel the scheduled decoherence
    /// event, and apply the storage error model for the elapsed duration.
    /// Non-destructive reads refresh the stored fidelity for the elapsed
    /// duration (resetting the store clock) and return a snapshot.
    pub fn read(
        &mut self,
        key: MemKey<'_>,
        destructive: bool,
        now: Time,
    ) -> Option<(usize, Entanglement)> {
        let idx = self.index_of(key)?;
        let slot = &mut self.slots[idx];
        let store_time = slot.store_time?;
        let elapsed = (now - store_time).sec();

        if destructive {
            let mut pair = slot.pair.take()?;
            slot.store_time = None;
            self.usage -= 1;
            pair.store_error_model(elapsed, self.decoherence_rate);
            if let Some(token) = self.pending_decohere.remove(&pair.name) {
                token.cancel();
            }
            Some((idx, pair))
        } else {
            let pair = slot.pair.as_mut()?;
            pair.store_error_model(elapsed, self.decoherence_rate);
            slot.store_time = Some(now);
            Some((idx, pair.clone()))
        }
    }

    /// Replace the pair stored under `old_name` with `new_pair`, keeping the
    /// store clock and moving the decoherence event to the new pair's deadline
    /// (a swap produces a pair sharing the oldest underlying clock).
    pub fn update(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        old_name: &str,
        new_pair: Entanglement,
    ) -> bool {
        let Some(idx) = self.index_of(MemKey::Name(old_name)) else {
            if let Some(stale) = self.pending_decohere.remove(old_name) {
                warn!("decohere event not cleared for missing pair {old_name}");
                stale.cancel();
            }
            return false;
        };

        if let Some(token) = self.pending_decohere.remove(old_name) {
            token.cancel();
        }
        if let Some(deadline) = new_pair.decoherence_time {
            let token = sim.schedule(
                deadline,
                NetEvent::MemoryDecohere {
                    node: self.node,
                    addr: idx,
                    pair: new_pair.name.clone(),
                },
            );
            self.pending_decohere.insert(new_pair.name.clone(), token);
        }
        self.slots[idx].pair = Some(new_pair);
        true
    }

    /// Release every slot and cancel all pending decoherence events.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.qubit.to_release();
            slot.pair = None;
            slot.store_time = None;
        }
        self.usage = 0;
        for (_, token) in std::mem::take(&mut self.pending_decohere) {
            token.cancel();
        }
    }

    /// Allocate up to `n` qubits (assigned to `qchannel` when given) to a path.
    /// Returns the allocated addresses.
    pub fn allocate(
        &mut self,
        path_id: PathId,
        direction: PathDirection,
        qchannel: Option<QChannelId>,
        n: usize,
    ) -> Vec<usize> {
        let mut allocated = Vec::new();
        for slot in &mut self.slots {
            if allocated.len() == n {
                break;
            }
            if slot.qubit.path_id.is_none()
                && qchannel.map_or(true, |ch| slot.qubit.qchannel == Some(ch))
            {
                slot.qubit.path_id = Some(path_id);
                slot.qubit.path_direction = Some(direction);
                allocated.push(slot.qubit.addr);
            }
        }
        allocated
    }

    /// Remove the path allocation of one slot.
    pub fn deallocate(&mut self, addr: usize) -> bool {
        match self.slots.get_mut(addr) {
            Some(slot) => {
                slot.qubit.path_id = None;
                slot.qubit.path_direction = None;
                true
            }
            None => false,
        }
    }

    /// Assign one unassigned qubit to a quantum channel. Returns its address.
    pub fn assign(&mut self, qchannel: QChannelId) -> Option<usize> {
        let slot = self.slots.iter_mut().find(|s| s.qubit.qchannel.is_none())?;
        slot.qubit.qchannel = Some(qchannel);
        Some(slot.qubit.addr)
    }

    /// Remove the channel assignment of one slot.
    pub fn unassign(&mut self, addr: usize) -> bool {
        match self.slots.get_mut(addr) {
            Some(slot) => {
                slot.qubit.qchannel = None;
                true
            }
            None => false,
        }
    }

    /// Slots assigned to the given channel.
    pub fn channel_slots(
        &self,
        qchannel: QChannelId,
    ) -> impl Iterator<Item = (&MemoryQubit, Option<&Entanglement>)> {
        self.slots
            .iter()
            .filter(move |s| s.qubit.qchannel == Some(qchannel))
            .map(|s| (&s.qubit, s.pair.as_ref()))
    }

    /// A free, unreserved slot matching the channel and path filters, usable
    /// to answer a reservation request.
    pub fn search_available(
        &self,
        qchannel: Option<QChannelId>,
        path_id: Option<PathId>,
    ) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| {
                s.pair.is_none()
                    && s.qubit.active.is_none()
                    && qchannel.map_or(true, |ch| s.qubit.qchannel == Some(ch))
                    && path_id.map_or(true, |p| s.qubit.path_id == Some(p))
            })
            .map(|s| s.qubit.addr)
    }

    /// First slot matching a predicate. With `has_epr`, only slots holding a
    /// pair are considered.
    pub fn find<P>(&self, has_epr: bool, mut pred: P) -> Option<(usize, Option<&Entanglement>)>
    where
        P: FnMut(&MemoryQubit, Option<&Entanglement>) -> bool,
    {
        self.slots
            .iter()
            .filter(|s| !has_epr || s.pair.is_some())
            .find(|s| pred(&s.qubit, s.pair.as_ref()))
            .map(|s| (s.qubit.addr, s.pair.as_ref()))
    }

    /// Non-destructive lookup.
    pub fn get(&self, key: MemKey<'_>) -> Option<(&MemoryQubit, Option<&Entanglement>)> {
        let idx = self.index_of(key)?;
        let slot = &self.slots[idx];
        Some((&slot.qubit, slot.pair.as_ref()))
    }

    /// When the pair under `key` was stored.
    pub fn get_store_time(&self, key: MemKey<'_>) -> Option<Time> {
        self.index_of(key).and_then(|idx| self.slots[idx].store_time)
    }

    #[must_use]
    pub fn qubit(&self, addr: usize) -> &MemoryQubit {
        &self.slots[addr].qubit
    }

    pub fn qubit_mut(&mut self, addr: usize) -> &mut MemoryQubit {
        &mut self.slots[addr].qubit
    }

    /// Mutable access to the pair stored at `addr`.
    pub fn pair_mut(&mut self, addr: usize) -> Option<&mut Entanglement> {
        self.slots[addr].pair.as_mut()
    }
}
