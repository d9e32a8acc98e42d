//! Shared-memory regions.
//!
//! Regions are frame lists owned by one process, grantable to others
//! and mappable into any grantee's address space. Like endpoints they
//! live in a generation-tokened slot table, so destruction invalidates
//! every outstanding token. Frames are zeroed at creation and freed at
//! destruction; mapping installs the caller's pages without zeroing.

use alloc::vec::Vec;

use lazy_static::lazy_static;

use super::error::{IpcError, Result};
use crate::config::{FRAME_SIZE, MAX_SHM_PAGES, MAX_SHM_REGIONS};
use crate::mm::address_space::AddressSpace;
use crate::mm::{Mapper, MapFlags, PhysicalAddress, VirtualAddress};
use crate::sched::Pid;
use crate::sync::IrqMutex;

/// Region token: slot id plus minting generation, packed like an
/// endpoint token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmToken {
    pub id: u32,
    pub generation: u32,
}

impl ShmToken {
    pub const fn as_u64(&self) -> u64 {
        (self.id as u64) | ((self.generation as u64) << 32)
    }

    pub const fn from_u64(raw: u64) -> Self {
        Self {
            id: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

struct ShmRegion {
    owner: Pid,
    frames: Vec<PhysicalAddress>,
    grants: Vec<Pid>,
    /// Current mappings, one per process: (pid, base va).
    mappings: Vec<(Pid, u64)>,
}

struct ShmSlot {
    region: Option<ShmRegion>,
    generation: u32,
}

/// Slot table for shared-memory regions.
pub struct ShmRegistry {
    slots: Vec<ShmSlot>,
    next_slot: usize,
}

impl ShmRegistry {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(ShmSlot {
                region: None,
                generation: 1,
            });
        }
        Self {
            slots,
            next_slot: 0,
        }
    }

    fn slot_mut(&mut self, token: ShmToken) -> Result<&mut ShmSlot> {
        let slot = self
            .slots
            .get_mut(token.id as usize)
            .ok_or(IpcError::InvalidToken)?;
        if slot.generation != token.generation || slot.region.is_none() {
            return Err(IpcError::InvalidToken);
        }
        Ok(slot)
    }

    /// Install a region. On a full table the frames are handed back so
    /// the caller can release them.
    pub fn create(
        &mut self,
        owner: Pid,
        frames: Vec<PhysicalAddress>,
    ) -> core::result::Result<ShmToken, Vec<PhysicalAddress>> {
        let capacity = self.slots.len();
        for i in 0..capacity {
            let idx = (self.next_slot + i) % capacity;
            if self.slots[idx].region.is_none() {
                let slot = &mut self.slots[idx];
                slot.region = Some(ShmRegion {
                    owner,
                    frames,
                    grants: Vec::new(),
                    mappings: Vec::new(),
                });
                self.next_slot = (idx + 1) % capacity;
                return Ok(ShmToken {
                    id: idx as u32,
                    generation: slot.generation,
                });
            }
        }
        Err(frames)
    }

    pub fn grant(&mut self, token: ShmToken, caller: Pid, grantee: Pid) -> Result<()> {
        let slot = self.slot_mut(token)?;
        let region = slot.region.as_mut().unwrap();
        if region.owner != caller {
            return Err(IpcError::NotOwner);
        }
        if !region.grants.contains(&grantee) {
            region.grants.push(grantee);
        }
        Ok(())
    }

    fn frames_for_map(&mut self, token: ShmToken, pid: Pid) -> Result<Vec<PhysicalAddress>> {
        let slot = self.slot_mut(token)?;
        let region = slot.region.as_mut().unwrap();
        if region.owner != pid && !region.grants.contains(&pid) {
            return Err(IpcError::RightsDenied);
        }
        if region.mappings.iter().any(|(p, _)| *p == pid) {
            return Err(IpcError::BadMessage);
        }
        Ok(region.frames.clone())
    }

    fn record_mapping(&mut self, token: ShmToken, pid: Pid, va: u64) -> Result<()> {
        let slot = self.slot_mut(token)?;
        slot.region.as_mut().unwrap().mappings.push((pid, va));
        Ok(())
    }

    fn take_mapping(&mut self, token: ShmToken, pid: Pid) -> Result<(u64, usize)> {
        let slot = self.slot_mut(token)?;
        let region = slot.region.as_mut().unwrap();
        let pos = region
            .mappings
            .iter()
            .position(|(p, _)| *p == pid)
            .ok_or(IpcError::BadMessage)?;
        let (_, va) = region.mappings.swap_remove(pos);
        Ok((va, region.frames.len()))
    }

    /// Detach a region for destruction. Refused while any mapping is
    /// live; unmap first, or the grantee would keep writable pages of
    /// freed frames.
    fn detach(&mut self, token: ShmToken, caller: Pid) -> Result<Vec<PhysicalAddress>> {
        let slot = self.slot_mut(token)?;
        let region = slot.region.as_ref().unwrap();
        if region.owner != caller {
            return Err(IpcError::NotOwner);
        }
        if !region.mappings.is_empty() {
            return Err(IpcError::BadMessage);
        }
        let region = slot.region.take().unwrap();
        slot.generation = slot.generation.wrapping_add(1);
        if slot.generation == 0 {
            slot.generation = 1;
        }
        Ok(region.frames)
    }
}

lazy_static! {
    static ref SHM: IrqMutex<ShmRegistry> = IrqMutex::new(ShmRegistry::new(MAX_SHM_REGIONS));
}

/// Allocate a zeroed region of `n_pages` frames owned by `owner`.
pub fn create(owner: Pid, n_pages: usize, mapper: &dyn Mapper) -> Result<ShmToken> {
    if n_pages == 0 || n_pages > MAX_SHM_PAGES {
        return Err(IpcError::BadMessage);
    }
    let mut frames = Vec::with_capacity(n_pages);
    for _ in 0..n_pages {
        match mapper.alloc_frame() {
            Some(f) => {
                // SAFETY: fresh frame reached through the direct map;
                // zeroed before any process can map it.
                unsafe {
                    core::ptr::write_bytes(
                        (mapper.hhdm_base() + f.as_u64()) as *mut u8,
                        0,
                        FRAME_SIZE,
                    );
                }
                frames.push(f);
            }
            None => {
                for f in frames {
                    mapper.free_frame(f);
                }
                return Err(IpcError::Exhausted);
            }
        }
    }
    match SHM.lock().create(owner, frames) {
        Ok(token) => Ok(token),
        Err(frames) => {
            for f in frames {
                mapper.free_frame(f);
            }
            Err(IpcError::Exhausted)
        }
    }
}

/// Allow `grantee` to map the region.
pub fn grant(token: ShmToken, caller: Pid, grantee: Pid) -> Result<()> {
    SHM.lock().grant(token, caller, grantee)
}

/// Map the region at `va` in `space` for `pid`.
pub fn map(token: ShmToken, pid: Pid, space: &AddressSpace, va: VirtualAddress) -> Result<()> {
    let frames = SHM.lock().frames_for_map(token, pid)?;
    for (i, frame) in frames.iter().enumerate() {
        if space
            .map_page(va.add(i * FRAME_SIZE), *frame, MapFlags::WRITABLE)
            .is_err()
        {
            for j in 0..i {
                space.unmap_page(va.add(j * FRAME_SIZE));
            }
            return Err(IpcError::BadMessage);
        }
    }
    SHM.lock().record_mapping(token, pid, va.as_u64())?;
    Ok(())
}

/// Remove `pid`'s mapping of the region. Frames stay owned by the
/// region.
pub fn unmap(token: ShmToken, pid: Pid, space: &AddressSpace) -> Result<()> {
    let (va, n_pages) = SHM.lock().take_mapping(token, pid)?;
    for i in 0..n_pages {
        space.unmap_page(VirtualAddress::new(va).add(i * FRAME_SIZE));
    }
    Ok(())
}

/// Destroy the region and free its frames. Fails while mapped.
pub fn destroy(token: ShmToken, caller: Pid, mapper: &dyn Mapper) -> Result<()> {
    let frames = SHM.lock().detach(token, caller)?;
    for f in frames {
        mapper.free_frame(f);
    }
    Ok(())
}

/// Process-exit sweep: drop `pid`'s mappings, then destroy its now
/// unmapped regions. Regions other processes still map stay alive
/// (ownerless until their mappers unmap; frames are freed then).
pub fn cleanup_for_exit(pid: Pid, space: &AddressSpace, mapper: &dyn Mapper) {
    let mut to_unmap = Vec::new();
    let mut to_free = Vec::new();
    {
        let mut reg = SHM.lock();
        for slot in reg.slots.iter_mut() {
            let Some(region) = slot.region.as_mut() else {
                continue;
            };
            if let Some(pos) = region.mappings.iter().position(|(p, _)| *p == pid) {
                let (_, va) = region.mappings.swap_remove(pos);
                to_unmap.push((va, region.frames.len()));
            }
            if region.owner == pid && region.mappings.is_empty() {
                let region = slot.region.take().unwrap();
                slot.generation = slot.generation.wrapping_add(1);
                if slot.generation == 0 {
                    slot.generation = 1;
                }
                to_free.push(region.frames);
            }
        }
    }
    for (va, n_pages) in to_unmap {
        for i in 0..n_pages {
            space.unmap_page(VirtualAddress::new(va).add(i * FRAME_SIZE));
        }
    }
    for frames in to_free {
        for f in frames {
            mapper.free_frame(f);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::page_table::tests::mock_mapper;

    const VA: VirtualAddress = VirtualAddress::new(0x6000_0000);

    #[test]
    fn create_map_unmap_destroy_cycle() {
        let (mapper, mem) = mock_mapper();
        let baseline = mem.outstanding();
        let token = create(100, 4, mapper).unwrap();
        assert_eq!(mem.outstanding(), baseline + 4);

        let space = AddressSpace::new(mapper).unwrap();
        map(token, 100, &space, VA).unwrap();
        assert_eq!(space.mapped_pages(), 4);

        // Mapped regions cannot be destroyed.
        assert_eq!(destroy(token, 100, mapper), Err(IpcError::BadMessage));

        unmap(token, 100, &space).unwrap();
        assert_eq!(space.mapped_pages(), 0);
        // Release the space's page-table frames before the final
        // accounting check.
        drop(space);
        destroy(token, 100, mapper).unwrap();
        assert_eq!(mem.outstanding(), baseline);
        // Token is stale now.
        assert_eq!(grant(token, 100, 101), Err(IpcError::InvalidToken));
    }

    #[test]
    fn mapping_requires_grant() {
        let (mapper, _mem) = mock_mapper();
        let token = create(200, 1, mapper).unwrap();
        let space = AddressSpace::new(mapper).unwrap();
        assert_eq!(
            map(token, 201, &space, VA),
            Err(IpcError::RightsDenied)
        );
        grant(token, 200, 201).unwrap();
        map(token, 201, &space, VA).unwrap();
        // Double-mapping by the same process is rejected.
        assert_eq!(map(token, 201, &space, VA), Err(IpcError::BadMessage));
        unmap(token, 201, &space).unwrap();
        destroy(token, 200, mapper).unwrap();
    }

    #[test]
    fn grant_requires_ownership() {
        let (mapper, _mem) = mock_mapper();
        let token = create(300, 1, mapper).unwrap();
        assert_eq!(grant(token, 301, 302), Err(IpcError::NotOwner));
        destroy(token, 300, mapper).unwrap();
    }

    #[test]
    fn shared_frames_alias_across_spaces() {
        let (mapper, _mem) = mock_mapper();
        let token = create(400, 1, mapper).unwrap();
        grant(token, 400, 401).unwrap();
        let a = AddressSpace::new(mapper).unwrap();
        let b = AddressSpace::new(mapper).unwrap();
        map(token, 400, &a, VA).unwrap();
        map(token, 401, &b, VA).unwrap();
        let pa_a = a.translate(VA.as_u64()).unwrap().phys;
        let pa_b = b.translate(VA.as_u64()).unwrap().phys;
        assert_eq!(pa_a, pa_b);
        unmap(token, 400, &a).unwrap();
        unmap(token, 401, &b).unwrap();
        destroy(token, 400, mapper).unwrap();
    }
}
