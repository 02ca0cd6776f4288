//! External reference table.
//!
//! Maps small integer handles to host values so module code can hold a
//! reference to a host object without its memory ever containing a pointer.
//! Slots are reused through a free list; the first [`RESERVED_SLOTS`] slots
//! are permanent sentinels.
//!
//! A handle carries the slot index in its low [`INDEX_BITS`] bits and the
//! slot generation above them. Retiring a slot bumps its generation before
//! the slot goes back on the free list, so every handle issued for the old
//! generation reads as [`SlotState::Retired`] from then on. A slot whose
//! generation is exhausted stays retired for good.

use crate::config::TableConfig;
use crate::error::{BridgeError, Result};
use crate::value::{Extern, HostValue};

/// Handle of the `undefined` sentinel.
pub const UNDEFINED: u32 = 0;
/// Handle of the `null` sentinel.
pub const NULL: u32 = 1;
/// Handle of the `true` sentinel.
pub const TRUE: u32 = 2;
/// Handle of the `false` sentinel.
pub const FALSE: u32 = 3;
/// Number of sentinel slots at the start of every table.
pub const RESERVED_SLOTS: u32 = 4;

/// Low handle bits holding the slot index.
pub const INDEX_BITS: u32 = 20;
/// Most slots a table can address.
pub const MAX_SLOTS: u32 = 1 << INDEX_BITS;

const INDEX_MASK: u32 = MAX_SLOTS - 1;
const MAX_GENERATION: u32 = u32::MAX >> INDEX_BITS;

fn split(handle: u32) -> (usize, u32) {
    ((handle & INDEX_MASK) as usize, handle >> INDEX_BITS)
}

fn join(index: usize, generation: u32) -> u32 {
    (generation << INDEX_BITS) | index as u32
}

/// Values that provide the canonical sentinel slot contents.
pub trait Sentinel: Sized {
    /// Contents of slots `0..RESERVED_SLOTS`, in handle order.
    fn sentinels() -> [Self; RESERVED_SLOTS as usize];
}

impl Sentinel for HostValue {
    fn sentinels() -> [Self; RESERVED_SLOTS as usize] {
        [
            HostValue::Undefined,
            HostValue::Null,
            HostValue::Bool(true),
            HostValue::Bool(false),
        ]
    }
}

impl Sentinel for Extern {
    fn sentinels() -> [Self; RESERVED_SLOTS as usize] {
        HostValue::sentinels().map(Extern::Value)
    }
}

/// Values that may have their own teardown path.
///
/// [`ExternRefTable::release`] refuses a value that reports a reason here;
/// such values leave the table through [`ExternRefTable::retire`].
pub trait Releasable {
    /// Why the value cannot be released directly, if it cannot.
    fn release_blocked(&self) -> Option<&'static str> {
        None
    }
}

impl Releasable for HostValue {}

impl Releasable for Extern {
    fn release_blocked(&self) -> Option<&'static str> {
        match self {
            Extern::Closure(_) => Some("slot holds a closure; destroy it instead"),
            Extern::Value(_) => None,
        }
    }
}

/// Sentinel handle for a value, if it has one.
pub fn sentinel_handle(value: &HostValue) -> Option<u32> {
    match value {
        HostValue::Undefined => Some(UNDEFINED),
        HostValue::Null => Some(NULL),
        HostValue::Bool(true) => Some(TRUE),
        HostValue::Bool(false) => Some(FALSE),
        _ => None,
    }
}

/// Observable state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Permanent sentinel.
    Reserved,
    /// On the free list.
    Vacant,
    /// Allocated, no value yet.
    Unset,
    /// Holds a value.
    Live,
    /// Issued for a retired generation of its slot. Never valid again.
    Retired,
    /// Beyond the table's current length, or never issued.
    OutOfRange,
}

#[derive(Debug)]
enum Slot<T> {
    Reserved(T),
    Vacant,
    Unset,
    Live(T),
    Retired,
}

/// Handle-indexed arena with a free list and per-slot generations.
#[derive(Debug)]
pub struct ExternRefTable<T> {
    slots: Vec<Slot<T>>,
    generations: Vec<u32>,
    free: Vec<u32>,
    capacity: u32,
    live: u32,
    config: TableConfig,
}

impl<T: Sentinel> ExternRefTable<T> {
    /// Create a table seeded with the sentinel slots.
    pub fn new(config: TableConfig) -> Self {
        let capacity = config
            .initial_capacity
            .max(RESERVED_SLOTS + 1)
            .min(MAX_SLOTS);
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.extend(T::sentinels().into_iter().map(Slot::Reserved));
        Self {
            generations: vec![0; slots.len()],
            slots,
            free: Vec::new(),
            capacity,
            live: 0,
            config,
        }
    }

    /// Rewrite the sentinel slots with their canonical values.
    ///
    /// Idempotent; this is the bootstrap hook the module may call during
    /// start-up.
    pub fn reseed(&mut self) {
        for (slot, value) in self.slots.iter_mut().zip(T::sentinels()) {
            *slot = Slot::Reserved(value);
        }
    }
}

impl<T> ExternRefTable<T> {
    /// Reserve a slot and return its handle, reusing freed slots first.
    pub fn alloc(&mut self) -> Result<u32> {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Slot::Unset;
                index as usize
            }
            None => {
                if self.slots.len() as u32 >= self.capacity {
                    self.grow()?;
                }
                self.slots.push(Slot::Unset);
                self.generations.push(0);
                self.slots.len() - 1
            }
        };
        self.live += 1;
        Ok(join(index, self.generations[index]))
    }

    /// Allocate a slot and store `value` in it.
    pub fn insert(&mut self, value: T) -> Result<u32> {
        let handle = self.alloc()?;
        self.slots[split(handle).0] = Slot::Live(value);
        Ok(handle)
    }

    /// Store a value in an allocated slot, replacing any previous value.
    pub fn set(&mut self, handle: u32, value: T) -> Result<()> {
        match self.slot_mut(handle) {
            Some(Slot::Reserved(_)) => Err(BridgeError::ReservedHandle { handle }),
            Some(slot @ (Slot::Unset | Slot::Live(_))) => {
                *slot = Slot::Live(value);
                Ok(())
            }
            _ => Err(self.reject(handle)),
        }
    }

    /// Borrow the value behind a handle. Sentinels are readable.
    pub fn get(&self, handle: u32) -> Result<&T> {
        match self.slot(handle) {
            Some(Slot::Reserved(v) | Slot::Live(v)) => Ok(v),
            _ => Err(self.reject(handle)),
        }
    }

    /// Mutably borrow a live value. Sentinels are not writable.
    pub fn get_mut(&mut self, handle: u32) -> Result<&mut T> {
        if let Some(Slot::Reserved(_)) = self.slot(handle) {
            return Err(BridgeError::ReservedHandle { handle });
        }
        let err = self.reject(handle);
        match self.slot_mut(handle) {
            Some(Slot::Live(v)) => Ok(v),
            _ => Err(err),
        }
    }

    /// Clear a slot that has its own teardown path.
    ///
    /// The slot is reused under a new generation, so `handle` itself is
    /// never valid again.
    pub fn retire(&mut self, handle: u32) -> Result<Option<T>> {
        let value = self.vacate(handle)?;
        let (index, generation) = split(handle);
        if generation < MAX_GENERATION {
            self.generations[index] = generation + 1;
            self.free.push(index as u32);
        } else {
            self.slots[index] = Slot::Retired;
            tracing::debug!(handle, "slot generations exhausted");
        }
        tracing::trace!(handle, "handle retired");
        Ok(value)
    }

    /// State of a handle.
    pub fn state(&self, handle: u32) -> SlotState {
        let (index, generation) = split(handle);
        match self.generations.get(index) {
            None => SlotState::OutOfRange,
            Some(&current) if generation < current => SlotState::Retired,
            Some(&current) if generation > current => SlotState::OutOfRange,
            Some(_) => match self.slots[index] {
                Slot::Reserved(_) => SlotState::Reserved,
                Slot::Vacant => SlotState::Vacant,
                Slot::Unset => SlotState::Unset,
                Slot::Live(_) => SlotState::Live,
                Slot::Retired => SlotState::Retired,
            },
        }
    }

    /// Check if a handle is one of the sentinels.
    pub fn is_reserved(&self, handle: u32) -> bool {
        handle < RESERVED_SLOTS
    }

    /// Number of allocated (unset or live) slots, sentinels excluded.
    pub fn live_count(&self) -> u32 {
        self.live
    }

    /// Current capacity.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Growth policy in effect.
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    fn slot(&self, handle: u32) -> Option<&Slot<T>> {
        let (index, generation) = split(handle);
        match self.generations.get(index) {
            Some(&current) if current == generation => self.slots.get(index),
            _ => None,
        }
    }

    fn slot_mut(&mut self, handle: u32) -> Option<&mut Slot<T>> {
        let (index, generation) = split(handle);
        match self.generations.get(index) {
            Some(&current) if current == generation => self.slots.get_mut(index),
            _ => None,
        }
    }

    fn vacate(&mut self, handle: u32) -> Result<Option<T>> {
        let value = match self.slot_mut(handle) {
            Some(Slot::Reserved(_)) => return Err(BridgeError::ReservedHandle { handle }),
            Some(slot @ (Slot::Unset | Slot::Live(_))) => {
                match std::mem::replace(slot, Slot::Vacant) {
                    Slot::Live(v) => Some(v),
                    _ => None,
                }
            }
            _ => return Err(self.reject(handle)),
        };
        self.live -= 1;
        Ok(value)
    }

    fn grow(&mut self) -> Result<()> {
        let current = self.capacity;
        let mut target = current
            .saturating_mul(self.config.growth_factor)
            .max(current + 1)
            .min(MAX_SLOTS);
        if let Some(max) = self.config.max_capacity {
            target = target.min(max);
        }
        if target <= current {
            return Err(BridgeError::TableFull { capacity: current });
        }
        self.slots.reserve((target - current) as usize);
        self.capacity = target;
        tracing::debug!(from = current, to = target, "reference table grown");
        Ok(())
    }

    fn reject(&self, handle: u32) -> BridgeError {
        let cause = match self.state(handle) {
            SlotState::Reserved => return BridgeError::ReservedHandle { handle },
            SlotState::Vacant => "already released",
            SlotState::Unset => "allocated but never set",
            SlotState::Retired => "retired",
            SlotState::OutOfRange => "out of range",
            SlotState::Live => "unexpected live slot",
        };
        BridgeError::invalid_handle(handle, cause)
    }
}

impl<T: Releasable> ExternRefTable<T> {
    /// Free a slot for reuse and return the value it held.
    ///
    /// The handle is reused as-is by a later allocation. Values with their
    /// own teardown path are refused.
    pub fn release(&mut self, handle: u32) -> Result<Option<T>> {
        if let Some(cause) = self.get(handle).ok().and_then(|v| v.release_blocked()) {
            return Err(BridgeError::invalid_handle(handle, cause));
        }
        let value = self.vacate(handle)?;
        self.free.push(split(handle).0 as u32);
        tracing::trace!(handle, "handle released");
        Ok(value)
    }

    /// Release a slot that must hold a value and return the value.
    pub fn take(&mut self, handle: u32) -> Result<T> {
        match self.slot(handle) {
            Some(Slot::Live(_)) => {}
            Some(Slot::Reserved(_)) => return Err(BridgeError::ReservedHandle { handle }),
            _ => return Err(self.reject(handle)),
        }
        self.release(handle)?
            .ok_or_else(|| BridgeError::invalid_handle(handle, "slot is empty"))
    }
}
