//! Process table.
//!
//! A process binds a pid to the resources the syscall layer charges
//! against it: an address space, a handle table and (indirectly, via
//! owner fields) endpoints and shared-memory regions. Tasks reference
//! their process by pid. Single-threaded processes: one task each.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;

use crate::config::MAX_PROCESSES;
use crate::ipc::handle::HandleObject;
use crate::ipc::{registry, shm, HandleTable};
use crate::mm::address_space::AddressSpace;
use crate::mm::Mapper;
use crate::sched::Pid;
use crate::sync::IrqMutex;

/// One user process.
pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub space: Arc<AddressSpace>,
    pub handles: IrqMutex<HandleTable>,
}

struct ProcessTable {
    map: BTreeMap<Pid, Arc<Process>>,
    next_pid: Pid,
}

static TABLE: IrqMutex<ProcessTable> = IrqMutex::new(ProcessTable {
    map: BTreeMap::new(),
    next_pid: 1,
});

/// Register a new process around an address space.
pub fn create(name: &str, space: Arc<AddressSpace>) -> Option<Arc<Process>> {
    let mut table = TABLE.lock();
    if table.map.len() >= MAX_PROCESSES {
        return None;
    }
    let pid = table.next_pid;
    table.next_pid += 1;
    let process = Arc::new(Process {
        pid,
        name: String::from(name),
        space,
        handles: IrqMutex::new(HandleTable::new()),
    });
    table.map.insert(pid, process.clone());
    Some(process)
}

pub fn get(pid: Pid) -> Option<Arc<Process>> {
    TABLE.lock().map.get(&pid).cloned()
}

pub fn count() -> usize {
    TABLE.lock().map.len()
}

/// Tear a process down: endpoints first (waking their waiters), then
/// handles (aborting parked callers whose reply right dies with us),
/// then shared memory, and finally the address space when the last
/// reference drops.
pub fn remove(pid: Pid, mapper: &dyn Mapper) {
    let process = {
        let mut table = TABLE.lock();
        table.map.remove(&pid)
    };
    let Some(process) = process else {
        return;
    };
    registry::destroy_all_owned_by(pid);
    let drained = process.handles.lock().drain();
    for object in drained {
        if let HandleObject::Caller(task) = object {
            crate::ipc::endpoint::abort_caller(task);
            crate::sched::release_caller_ref(task);
        }
    }
    shm::cleanup_for_exit(pid, &process.space, mapper);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::ipc::{HandleKind, Rights};
    use crate::mm::page_table::tests::mock_mapper;

    #[test]
    fn create_assigns_increasing_pids() {
        let (mapper, _mem) = mock_mapper();
        let a = create("alpha", AddressSpace::new(mapper).unwrap()).unwrap();
        let b = create("beta", AddressSpace::new(mapper).unwrap()).unwrap();
        assert!(b.pid > a.pid);
        assert!(get(a.pid).is_some());
        remove(a.pid, mapper);
        remove(b.pid, mapper);
        assert!(get(a.pid).is_none());
    }

    #[test]
    fn remove_destroys_owned_endpoints() {
        let (mapper, _mem) = mock_mapper();
        let p = create("svc", AddressSpace::new(mapper).unwrap()).unwrap();
        let (token, ep) = registry::create(p.pid).unwrap();
        p.handles
            .lock()
            .install(
                HandleKind::Endpoint,
                Rights::ENDPOINT_DEFAULT,
                HandleObject::Endpoint(token),
            )
            .unwrap();
        remove(p.pid, mapper);
        assert!(registry::acquire(token).is_none());
        assert!(!ep.is_alive());
    }
}
