//! Global endpoint registry.
//!
//! Endpoints live in a fixed slot table and are referenced through
//! `(id, generation)` tokens. Destroying an endpoint bumps the slot's
//! generation, so every surviving token goes stale atomically; slot
//! storage is recycled but capabilities are not.

use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;

use super::endpoint::Endpoint;
use super::error::{IpcError, Result};
use crate::config::MAX_ENDPOINTS;
use crate::sched::Pid;
use crate::sync::IrqMutex;

/// Registry token: endpoint id plus the slot generation it was minted
/// under. The packed form is what crosses the syscall boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointToken {
    pub id: u32,
    pub generation: u32,
}

impl EndpointToken {
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

struct RegistrySlot {
    endpoint: Option<Arc<Endpoint>>,
    owner: Pid,
    generation: u32,
}

/// Slot table plus a rolling allocation cursor.
pub struct EndpointRegistry {
    slots: Vec<RegistrySlot>,
    next_slot: usize,
    created: u64,
    destroyed: u64,
}

impl EndpointRegistry {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(RegistrySlot {
                endpoint: None,
                owner: 0,
                generation: 1,
            });
        }
        Self {
            slots,
            next_slot: 0,
            created: 0,
            destroyed: 0,
        }
    }

    /// Claim the first free slot, scanning cyclically from the cursor.
    pub fn create(&mut self, owner: Pid) -> Result<(EndpointToken, Arc<Endpoint>)> {
        let capacity = self.slots.len();
        for i in 0..capacity {
            let idx = (self.next_slot + i) % capacity;
            if self.slots[idx].endpoint.is_none() {
                let ep = Endpoint::new(idx as u32);
                let slot = &mut self.slots[idx];
                slot.endpoint = Some(ep.clone());
                slot.owner = owner;
                self.next_slot = (idx + 1) % capacity;
                self.created += 1;
                return Ok((
                    EndpointToken {
                        id: idx as u32,
                        generation: slot.generation,
                    },
                    ep,
                ));
            }
        }
        Err(IpcError::Exhausted)
    }

    /// Resolve a token to its endpoint iff the generation still
    /// matches.
    pub fn acquire(&self, token: EndpointToken) -> Option<Arc<Endpoint>> {
        let slot = self.slots.get(token.id as usize)?;
        if slot.generation != token.generation {
            return None;
        }
        slot.endpoint.clone()
    }

    pub fn owner_of(&self, token: EndpointToken) -> Option<Pid> {
        let slot = self.slots.get(token.id as usize)?;
        if slot.generation != token.generation || slot.endpoint.is_none() {
            return None;
        }
        Some(slot.owner)
    }

    /// Detach the endpoint from its slot, invalidating every token.
    /// Returns the registry's reference for the caller to close and
    /// drop outside the registry lock.
    fn detach(&mut self, token: EndpointToken, caller: Pid) -> Result<Arc<Endpoint>> {
        let slot = self
            .slots
            .get_mut(token.id as usize)
            .ok_or(IpcError::InvalidToken)?;
        if slot.generation != token.generation {
            return Err(IpcError::InvalidToken);
        }
        if slot.endpoint.is_none() {
            return Err(IpcError::InvalidToken);
        }
        if slot.owner != caller {
            return Err(IpcError::NotOwner);
        }
        let ep = slot.endpoint.take().unwrap();
        slot.owner = 0;
        slot.generation = slot.generation.wrapping_add(1);
        if slot.generation == 0 {
            slot.generation = 1;
        }
        self.destroyed += 1;
        Ok(ep)
    }

    /// Tokens owned by `pid`, for process teardown.
    fn tokens_owned_by(&self, pid: Pid) -> Vec<EndpointToken> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.endpoint.is_some() && s.owner == pid)
            .map(|(id, s)| EndpointToken {
                id: id as u32,
                generation: s.generation,
            })
            .collect()
    }

    pub fn live_endpoints(&self) -> usize {
        self.slots.iter().filter(|s| s.endpoint.is_some()).count()
    }

    /// Lifetime counters: (created, destroyed).
    pub fn counters(&self) -> (u64, u64) {
        (self.created, self.destroyed)
    }
}

lazy_static! {
    static ref REGISTRY: IrqMutex<EndpointRegistry> =
        IrqMutex::new(EndpointRegistry::new(MAX_ENDPOINTS));
}

/// Create an endpoint owned by `owner`.
pub fn create(owner: Pid) -> Result<(EndpointToken, Arc<Endpoint>)> {
    REGISTRY.lock().create(owner)
}

/// Resolve a token; the returned Arc keeps the endpoint alive across
/// the operation regardless of concurrent destruction.
pub fn acquire(token: EndpointToken) -> Option<Arc<Endpoint>> {
    REGISTRY.lock().acquire(token)
}

pub fn owner_of(token: EndpointToken) -> Option<Pid> {
    REGISTRY.lock().owner_of(token)
}

/// Destroy an endpoint: invalidate its tokens, then wake all waiters
/// (outside the registry lock; begin_close takes the endpoint lock
/// and wakes into scheduler locks).
pub fn destroy(token: EndpointToken, caller: Pid) -> Result<()> {
    let ep = REGISTRY.lock().detach(token, caller)?;
    ep.begin_close();
    drop(ep);
    Ok(())
}

/// Destroy every endpoint `pid` owns (process teardown).
pub fn destroy_all_owned_by(pid: Pid) {
    let tokens = REGISTRY.lock().tokens_owned_by(pid);
    for token in tokens {
        let _ = destroy(token, pid);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn create_acquire_roundtrip() {
        let mut reg = EndpointRegistry::new(8);
        let (token, ep) = reg.create(10).unwrap();
        assert_eq!(reg.owner_of(token), Some(10));
        let got = reg.acquire(token).expect("token resolution failed");
        assert!(Arc::ptr_eq(&ep, &got));
        let packed = EndpointToken::from_u64(token.as_u64());
        assert_eq!(packed, token);
    }

    #[test]
    fn destroy_invalidates_surviving_tokens() {
        let mut reg = EndpointRegistry::new(8);
        let (token, ep) = reg.create(1).unwrap();
        let survivor = token;
        let detached = reg.detach(token, 1).unwrap();
        assert!(Arc::ptr_eq(&ep, &detached));
        assert!(reg.acquire(survivor).is_none());
        assert!(reg.owner_of(survivor).is_none());
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let mut reg = EndpointRegistry::new(1);
        let (first, _ep) = reg.create(1).unwrap();
        reg.detach(first, 1).unwrap();
        let (second, _ep2) = reg.create(1).unwrap();
        assert_eq!(first.id, second.id);
        assert_ne!(first.generation, second.generation);
        assert_ne!(second.generation, 0);
        // The stale token still fails even though the slot is live.
        assert!(reg.acquire(first).is_none());
    }

    #[test]
    fn destroy_requires_ownership() {
        let mut reg = EndpointRegistry::new(4);
        let (token, _ep) = reg.create(5).unwrap();
        assert!(matches!(reg.detach(token, 6), Err(IpcError::NotOwner)));
        assert!(reg.acquire(token).is_some());
        assert!(reg.detach(token, 5).is_ok());
    }

    #[test]
    fn exhaustion_reports_again() {
        let mut reg = EndpointRegistry::new(2);
        reg.create(1).unwrap();
        reg.create(1).unwrap();
        assert!(matches!(reg.create(1), Err(IpcError::Exhausted)));
    }

    #[test]
    fn cyclic_allocation_avoids_fresh_slot_reuse() {
        let mut reg = EndpointRegistry::new(4);
        let (t0, _e0) = reg.create(1).unwrap();
        let _keep = reg.create(1).unwrap();
        reg.detach(t0, 1).unwrap();
        // The cursor moved past slot 0, so the next create picks a
        // never-used slot before recycling slot 0.
        let (t2, _e2) = reg.create(1).unwrap();
        assert_ne!(t2.id, t0.id);
    }

    #[test]
    fn teardown_sweep_collects_by_owner() {
        let mut reg = EndpointRegistry::new(8);
        reg.create(7).unwrap();
        reg.create(8).unwrap();
        reg.create(7).unwrap();
        let mine = reg.tokens_owned_by(7);
        assert_eq!(mine.len(), 2);
        for t in mine {
            reg.detach(t, 7).unwrap();
        }
        assert_eq!(reg.live_endpoints(), 1);
    }
}
