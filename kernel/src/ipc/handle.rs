//! Per-process handle table.
//!
//! A handle is a packed 32-bit value the process uses to name a kernel
//! object: `{index:14, generation:12, kind:2, rights:4}`. The table
//! slot is authoritative: lookup verifies the generation, the kind and
//! that the required rights are a subset of the granted ones. Freeing a
//! slot bumps its generation, invalidating every outstanding copy of
//! the handle.

use alloc::vec::Vec;

use bitflags::bitflags;

use super::error::{IpcError, Result};
use super::registry::EndpointToken;
use crate::config::MAX_HANDLE_SLOTS;
use crate::sched::TaskPtr;

bitflags! {
    /// Rights a handle grants over its object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u8 {
        const SEND    = 1 << 0;
        const RECEIVE = 1 << 1;
        const CALL    = 1 << 2;
        const REPLY   = 1 << 3;
    }
}

impl Rights {
    /// Default rights on a freshly created endpoint handle.
    pub const ENDPOINT_DEFAULT: Rights = Rights::SEND.union(Rights::RECEIVE).union(Rights::CALL);
}

/// What a handle refers to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Endpoint = 1,
    /// Single-use reply capability minted by `ipc_receive`.
    Caller = 2,
}

/// Object stored in a handle slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleObject {
    Endpoint(EndpointToken),
    Caller(TaskPtr),
}

/// The packed user-visible handle value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Handle(u32);

const INDEX_BITS: u32 = 14;
const GEN_BITS: u32 = 12;
const KIND_BITS: u32 = 2;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GEN_MASK: u32 = (1 << GEN_BITS) - 1;
const KIND_MASK: u32 = (1 << KIND_BITS) - 1;

impl Handle {
    pub fn new(index: u16, generation: u16, kind: HandleKind, rights: Rights) -> Self {
        debug_assert!((index as u32) <= INDEX_MASK);
        debug_assert!((generation as u32) <= GEN_MASK);
        Self(
            index as u32
                | ((generation as u32 & GEN_MASK) << INDEX_BITS)
                | ((kind as u32 & KIND_MASK) << (INDEX_BITS + GEN_BITS))
                | ((rights.bits() as u32) << (INDEX_BITS + GEN_BITS + KIND_BITS)),
        )
    }

    pub const fn index(&self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    pub const fn generation(&self) -> u16 {
        ((self.0 >> INDEX_BITS) & GEN_MASK) as u16
    }

    pub fn kind(&self) -> Option<HandleKind> {
        match (self.0 >> (INDEX_BITS + GEN_BITS)) & KIND_MASK {
            1 => Some(HandleKind::Endpoint),
            2 => Some(HandleKind::Caller),
            _ => None,
        }
    }

    pub fn rights(&self) -> Rights {
        Rights::from_bits_truncate((self.0 >> (INDEX_BITS + GEN_BITS + KIND_BITS)) as u8)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }
}

struct HandleSlot {
    generation: u16,
    entry: Option<(HandleKind, Rights, HandleObject)>,
}

/// One process's handle table. Slots grow on demand up to the 14-bit
/// index ceiling.
pub struct HandleTable {
    slots: Vec<HandleSlot>,
    /// Scan cursor for the next install.
    next_free: usize,
    live: usize,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_free: 0,
            live: 0,
        }
    }

    pub fn live_handles(&self) -> usize {
        self.live
    }

    /// Store an object, returning its packed handle.
    pub fn install(
        &mut self,
        kind: HandleKind,
        rights: Rights,
        object: HandleObject,
    ) -> Result<Handle> {
        let capacity = self.slots.len();
        let mut index = None;
        for i in 0..capacity {
            let idx = (self.next_free + i) % capacity;
            if self.slots[idx].entry.is_none() {
                index = Some(idx);
                break;
            }
        }
        let idx = match index {
            Some(idx) => idx,
            None => {
                if capacity >= MAX_HANDLE_SLOTS {
                    return Err(IpcError::Exhausted);
                }
                self.slots.push(HandleSlot {
                    generation: 1,
                    entry: None,
                });
                capacity
            }
        };
        let next_free = (idx + 1) % self.slots.len().max(1);
        let slot = &mut self.slots[idx];
        slot.entry = Some((kind, rights, object));
        self.next_free = next_free;
        self.live += 1;
        Ok(Handle::new(idx as u16, slot.generation, kind, rights))
    }

    fn slot_for(&self, handle: Handle) -> Result<&HandleSlot> {
        let slot = self
            .slots
            .get(handle.index())
            .ok_or(IpcError::InvalidHandle)?;
        if slot.generation != handle.generation() || slot.entry.is_none() {
            return Err(IpcError::InvalidHandle);
        }
        Ok(slot)
    }

    /// Resolve a handle, verifying kind and required rights.
    pub fn lookup(
        &self,
        handle: Handle,
        expected: HandleKind,
        need: Rights,
    ) -> Result<HandleObject> {
        let slot = self.slot_for(handle)?;
        let (kind, rights, object) = slot.entry.unwrap();
        if kind != expected || handle.kind() != Some(expected) {
            return Err(IpcError::InvalidHandle);
        }
        if !rights.contains(need) {
            return Err(IpcError::RightsDenied);
        }
        Ok(object)
    }

    /// Remove a handle, invalidating all copies by bumping the slot
    /// generation. Returns the stored object.
    pub fn free(&mut self, handle: Handle) -> Result<HandleObject> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or(IpcError::InvalidHandle)?;
        if slot.generation != handle.generation() || slot.entry.is_none() {
            return Err(IpcError::InvalidHandle);
        }
        let (_, _, object) = slot.entry.take().unwrap();
        slot.generation = (slot.generation + 1) & GEN_MASK as u16;
        if slot.generation == 0 {
            slot.generation = 1;
        }
        self.live -= 1;
        if handle.index() < self.next_free {
            self.next_free = handle.index();
        }
        Ok(object)
    }

    /// Empty the table for process teardown, yielding every object so
    /// the caller can release the underlying resources.
    pub fn drain(&mut self) -> Vec<HandleObject> {
        let mut out = Vec::new();
        for slot in &mut self.slots {
            if let Some((_, _, object)) = slot.entry.take() {
                out.push(object);
                slot.generation = (slot.generation + 1) & GEN_MASK as u16;
                if slot.generation == 0 {
                    slot.generation = 1;
                }
            }
        }
        self.live = 0;
        out
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn token(id: u32) -> EndpointToken {
        EndpointToken { id, generation: 1 }
    }

    #[test]
    fn handle_packing_roundtrip() {
        let h = Handle::new(0x2abc, 0xeff, HandleKind::Caller, Rights::REPLY);
        assert_eq!(h.index(), 0x2abc);
        assert_eq!(h.generation(), 0xeff);
        assert_eq!(h.kind(), Some(HandleKind::Caller));
        assert_eq!(h.rights(), Rights::REPLY);
        assert_eq!(Handle::from_u32(h.as_u32()), h);
    }

    #[test]
    fn install_lookup_free_cycle() {
        let mut table = HandleTable::new();
        let h = table
            .install(
                HandleKind::Endpoint,
                Rights::ENDPOINT_DEFAULT,
                HandleObject::Endpoint(token(3)),
            )
            .unwrap();
        match table.lookup(h, HandleKind::Endpoint, Rights::SEND).unwrap() {
            HandleObject::Endpoint(t) => assert_eq!(t.id, 3),
            other => panic!("wrong object: {:?}", other),
        }
        table.free(h).unwrap();
        assert_eq!(
            table.lookup(h, HandleKind::Endpoint, Rights::SEND),
            Err(IpcError::InvalidHandle)
        );
        assert_eq!(table.live_handles(), 0);
    }

    #[test]
    fn stale_generation_rejected_after_reuse() {
        let mut table = HandleTable::new();
        let h1 = table
            .install(
                HandleKind::Endpoint,
                Rights::SEND,
                HandleObject::Endpoint(token(1)),
            )
            .unwrap();
        table.free(h1).unwrap();
        let h2 = table
            .install(
                HandleKind::Endpoint,
                Rights::SEND,
                HandleObject::Endpoint(token(2)),
            )
            .unwrap();
        assert_eq!(h1.index(), h2.index());
        assert_ne!(h1.generation(), h2.generation());
        assert!(table.lookup(h1, HandleKind::Endpoint, Rights::SEND).is_err());
        assert!(table.lookup(h2, HandleKind::Endpoint, Rights::SEND).is_ok());
    }

    #[test]
    fn rights_subset_enforced() {
        let mut table = HandleTable::new();
        let h = table
            .install(
                HandleKind::Endpoint,
                Rights::SEND | Rights::CALL,
                HandleObject::Endpoint(token(1)),
            )
            .unwrap();
        assert!(table.lookup(h, HandleKind::Endpoint, Rights::SEND).is_ok());
        assert!(table
            .lookup(h, HandleKind::Endpoint, Rights::SEND | Rights::CALL)
            .is_ok());
        assert_eq!(
            table.lookup(h, HandleKind::Endpoint, Rights::RECEIVE),
            Err(IpcError::RightsDenied)
        );
    }

    #[test]
    fn kind_mismatch_rejected() {
        let mut table = HandleTable::new();
        let h = table
            .install(
                HandleKind::Endpoint,
                Rights::SEND,
                HandleObject::Endpoint(token(1)),
            )
            .unwrap();
        assert_eq!(
            table.lookup(h, HandleKind::Caller, Rights::SEND),
            Err(IpcError::InvalidHandle)
        );
    }

    #[test]
    fn drain_empties_and_invalidates() {
        let mut table = HandleTable::new();
        let handles: alloc::vec::Vec<_> = (0..5)
            .map(|i| {
                table
                    .install(
                        HandleKind::Endpoint,
                        Rights::SEND,
                        HandleObject::Endpoint(token(i)),
                    )
                    .unwrap()
            })
            .collect();
        let drained = table.drain();
        assert_eq!(drained.len(), 5);
        assert_eq!(table.live_handles(), 0);
        for h in handles {
            assert!(table.lookup(h, HandleKind::Endpoint, Rights::SEND).is_err());
        }
    }
}
