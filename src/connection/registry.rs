//! Connection Registry
//!
//! Generational slot arenas holding the physical and logical connections.
//! Vacated slots are reused, but every reuse bumps the slot generation, so an
//! id handed out before the slot was vacated can never name the newcomer.

use std::fmt;
use std::marker::PhantomData;

use super::error::{ConnError, ConnResult};
use super::logical::LogicalConnection;
use super::physical::PhysicalConnection;
use std::sync::Arc;

/// Packed `(generation << 32) | index` identifier.
pub struct SlotId<T> {
    raw: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SlotId<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            raw: ((generation as u64) << 32) | index as u64,
            _marker: PhantomData,
        }
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn as_raw(&self) -> u64 {
        self.raw
    }

    pub fn index(&self) -> u32 {
        self.raw as u32
    }

    pub fn generation(&self) -> u32 {
        (self.raw >> 32) as u32
    }
}

// Manual impls: derives would put bounds on T.
impl<T> Clone for SlotId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlotId<T> {}

impl<T> PartialEq for SlotId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for SlotId<T> {}

impl<T> std::hash::Hash for SlotId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> fmt::Debug for SlotId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index(), self.generation())
    }
}

impl<T> fmt::Display for SlotId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index(), self.generation())
    }
}

/// Id of a logical (per-session) connection
pub type LogicalId = SlotId<LogicalConnection>;
/// Id of a physical (socket-owning) connection
pub type PhysicalId = SlotId<Arc<PhysicalConnection>>;

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Index-addressed storage with tombstoned, generation-tagged slots
#[derive(Debug)]
pub struct SlotArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    occupied: usize,
    capacity: usize,
}

impl<T> SlotArena<T> {
    /// Create an arena that refuses to hold more than `capacity` live values
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            occupied: 0,
            capacity,
        }
    }

    /// Store a value built from the id it is about to receive
    pub fn insert_with(&mut self, build: impl FnOnce(SlotId<T>) -> T) -> ConnResult<SlotId<T>> {
        if self.occupied >= self.capacity {
            return Err(ConnError::ResourceExhaustion(format!(
                "registry full ({} live entries)",
                self.occupied
            )));
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| {
                    ConnError::ResourceExhaustion("registry index space exhausted".to_string())
                })?;
                self.slots.try_reserve(1).map_err(|e| {
                    ConnError::ResourceExhaustion(format!("cannot grow registry: {}", e))
                })?;
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        let id = SlotId::new(index, slot.generation);
        slot.value = Some(build(id));
        self.occupied += 1;
        Ok(id)
    }

    pub fn insert(&mut self, value: T) -> ConnResult<SlotId<T>> {
        self.insert_with(|_| value)
    }

    fn slot(&self, id: SlotId<T>) -> Option<&Slot<T>> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
    }

    pub fn get(&self, id: SlotId<T>) -> Option<&T> {
        self.slot(id).and_then(|slot| slot.value.as_ref())
    }

    pub fn contains(&self, id: SlotId<T>) -> bool {
        self.get(id).is_some()
    }

    /// Vacate the slot, returning its value. The slot generation is bumped
    /// so `id` stays invalid forever.
    pub fn remove(&mut self, id: SlotId<T>) -> Option<T> {
        let slot = self
            .slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())?;
        let value = slot.value.take()?;

        slot.generation = slot.generation.wrapping_add(1);
        // A slot whose generation wrapped is retired rather than recycled
        if slot.generation != 0 {
            self.free.push(id.index());
        }
        self.occupied -= 1;
        Some(value)
    }

    /// Occupied slots with their ids
    pub fn iter(&self) -> impl Iterator<Item = (SlotId<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (SlotId::new(index as u32, slot.generation), value))
        })
    }

    pub fn ids(&self) -> Vec<SlotId<T>> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Number of slots ever allocated, occupied or not
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// Both connection collections, guarded together by the manager's registry lock
#[derive(Debug)]
pub struct ConnectionRegistry {
    pub physical: SlotArena<Arc<PhysicalConnection>>,
    pub logical: SlotArena<LogicalConnection>,
}

impl ConnectionRegistry {
    pub fn new(max_logical_connections: usize) -> Self {
        Self {
            physical: SlotArena::with_capacity_limit(max_logical_connections),
            logical: SlotArena::with_capacity_limit(max_logical_connections),
        }
    }

    /// Count the logical connections bound to `physical`. Linear in the
    /// number of logical slots.
    pub fn ref_count(&self, physical: PhysicalId) -> usize {
        self.logical
            .iter()
            .filter(|(_, logical)| logical.physical_id() == physical)
            .count()
    }

    /// Find a live physical connection serving `endpoint`
    pub fn find_physical(&self, endpoint: &super::Endpoint) -> Option<(PhysicalId, &Arc<PhysicalConnection>)> {
        self.physical.iter().find(|(_, phys)| {
            phys.is_valid()
                && phys.is_port(endpoint.port)
                && (phys.is_address(&endpoint.host)
                    || (!endpoint.resolved_address.is_empty()
                        && phys.is_address(&endpoint.resolved_address)))
        })
    }
}
