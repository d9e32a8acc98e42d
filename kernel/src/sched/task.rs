//! Task control block.
//!
//! A task is schedulable kernel stack plus identity. The embedded
//! `prev`/`next` pair is the task's *only* list linkage: a task is on
//! at most one list at any time: one run queue, or one endpoint wait
//! queue, or none (running/dead). Both queue kinds reuse the same two
//! fields, which is safe precisely because of that invariant.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::arch::x86_64::context;
use crate::config::{DEFAULT_PRIORITY, KERNEL_STACK_SIZE, PRIORITY_LEVELS};
use crate::ipc::message::Message;
use crate::mm::address_space::AddressSpace;

pub type Tid = u64;
pub type Pid = u64;

/// Scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Dead,
}

/// Priority bands. Lower numeric priority runs first.
pub mod band {
    pub const REALTIME_MAX: u8 = 7;
    pub const SYSTEM_MAX: u8 = 15;
    pub const NORMAL_MAX: u8 = 23;
    pub const BATCH_MAX: u8 = 27;
    pub const IDLE_MIN: u8 = 28;
}

/// Time slice in 1 ms ticks for a priority level.
pub fn time_slice_for(priority: u8) -> u32 {
    match priority {
        0..=band::REALTIME_MAX => 1,
        8..=band::SYSTEM_MAX => 2,
        16..=band::NORMAL_MAX => 4,
        24..=band::BATCH_MAX => 8,
        _ => 1,
    }
}

/// Outcome of the IPC wait a task just finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpcWaitStatus {
    #[default]
    Ok,
    /// The endpoint was destroyed while the task waited.
    Closed,
}

/// Per-task IPC rendezvous slot. The kernel copies messages directly
/// between these; no endpoint-owned buffers exist.
#[derive(Default)]
pub struct IpcSlot {
    pub message: Message,
    /// Set on a receiver when the sender performed a call and is
    /// parked waiting for the reply.
    pub caller: Option<TaskPtr>,
    /// Set on a sender blocked in a call.
    pub waiting_for_reply: bool,
    pub status: IpcWaitStatus,
}

/// Saved user-mode architectural state.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchTaskState {
    pub user_fs_base: u64,
    pub user_gs_base: u64,
}

/// Shareable raw task pointer. Tasks are leaked boxes owned by the
/// scheduler; the pointer stays valid until the reaper frees a dead
/// task with no outstanding caller references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPtr(NonNull<Task>);

// SAFETY: access to the pointee is serialized by scheduler / endpoint
// locks; the pointer itself is freely shareable.
unsafe impl Send for TaskPtr {}
unsafe impl Sync for TaskPtr {}

impl TaskPtr {
    pub fn new(ptr: NonNull<Task>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(&self) -> NonNull<Task> {
        self.0
    }

    /// # Safety
    ///
    /// Caller must hold a lock that keeps the task alive and serialized
    /// (scheduler CPU lock or the endpoint lock the task waits on).
    pub unsafe fn get_mut(&self) -> &mut Task {
        // SAFETY: forwarded contract.
        unsafe { &mut *self.0.as_ptr() }
    }
}

/// The task control block.
pub struct Task {
    pub tid: Tid,
    pub pid: Pid,
    pub name: String,
    pub state: TaskState,
    /// 0..=31, lower runs first.
    pub priority: u8,
    /// Remaining ticks in the current quantum.
    pub quantum: u32,
    pub total_ticks: u64,
    /// CPU this task is assigned to (queue residency).
    pub cpu: u32,
    /// Pinned tasks are never migrated by work stealing.
    pub pinned: bool,
    /// True from the moment a CPU decides to run this task until its
    /// register state has been fully saved again. Work stealing skips
    /// tasks with this set: their saved stack pointer is stale.
    pub on_cpu: AtomicBool,
    /// Saved kernel stack pointer while not running.
    pub kernel_rsp: u64,
    /// Backing storage for the kernel stack.
    kstack: Box<[u8]>,
    /// Intrusive list linkage; see module docs.
    pub prev: *mut Task,
    pub next: *mut Task,
    /// Opaque channel this task blocks on (endpoint address, keyboard).
    pub wait_channel: usize,
    pub ipc: IpcSlot,
    /// Outstanding caller handles pointing at this task. A dead task is
    /// only reaped once this drops to zero.
    pub caller_refs: AtomicUsize,
    pub address_space: Option<Arc<AddressSpace>>,
    pub arch: ArchTaskState,
    pub user_entry: u64,
    pub user_stack: u64,
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh task id.
pub fn alloc_tid() -> Tid {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

impl Task {
    fn empty(name: String, priority: u8, pid: Pid) -> Box<Self> {
        assert!((priority as usize) < PRIORITY_LEVELS);
        Box::new(Self {
            tid: alloc_tid(),
            pid,
            name,
            state: TaskState::Ready,
            priority,
            quantum: time_slice_for(priority),
            total_ticks: 0,
            cpu: 0,
            pinned: false,
            on_cpu: AtomicBool::new(false),
            kernel_rsp: 0,
            kstack: alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice(),
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
            wait_channel: 0,
            ipc: IpcSlot::default(),
            caller_refs: AtomicUsize::new(0),
            address_space: None,
            arch: ArchTaskState::default(),
            user_entry: 0,
            user_stack: 0,
        })
    }

    /// 16-aligned exclusive top of the kernel stack.
    pub fn kernel_stack_top(&self) -> u64 {
        (self.kstack.as_ptr() as u64 + self.kstack.len() as u64) & !15
    }

    fn prepare_stack(&mut self, entry: extern "C" fn(usize), arg: usize) {
        self.kernel_rsp = context::prepare_initial_stack(self.kernel_stack_top(), entry, arg);
    }

    /// Create a kernel task running `entry(arg)`.
    pub fn new_kernel(
        name: &str,
        entry: extern "C" fn(usize),
        arg: usize,
        priority: u8,
    ) -> Box<Self> {
        let mut task = Self::empty(String::from(name), priority, 0);
        task.prepare_stack(entry, arg);
        task
    }

    /// Create a user task. Its kernel-side entry drops to ring 3 at
    /// `user_entry` with `user_stack` once first scheduled.
    pub fn new_user(
        name: &str,
        pid: Pid,
        user_entry: u64,
        user_stack: u64,
        space: Arc<AddressSpace>,
    ) -> Box<Self> {
        let mut task = Self::empty(String::from(name), DEFAULT_PRIORITY, pid);
        task.address_space = Some(space);
        task.user_entry = user_entry;
        task.user_stack = user_stack;
        let arg = &mut *task as *mut Task as usize;
        task.prepare_stack(user_task_entry, arg);
        task
    }

    /// Synthesize the task representing the boot flow itself. Its
    /// context is the stack it is already running on; `kernel_rsp` is
    /// filled in by the first switch away from it.
    pub fn new_boot(cpu: u32) -> Box<Self> {
        let mut task = Self::empty(String::from("boot"), 8, 0);
        task.cpu = cpu;
        task.pinned = true;
        task
    }

    /// Create the per-CPU idle task.
    pub fn new_idle(cpu: u32) -> Box<Self> {
        let mut task = Self::empty(alloc::format!("idle/{}", cpu), 31, 0);
        task.cpu = cpu;
        task.pinned = true;
        task.prepare_stack(crate::sched::idle_task_entry, cpu as usize);
        task
    }

    pub fn is_user(&self) -> bool {
        self.address_space.is_some()
    }

    pub fn refresh_quantum(&mut self) {
        self.quantum = time_slice_for(self.priority);
    }
}

/// Kernel-side entry for user tasks: transition to ring 3.
extern "C" fn user_task_entry(arg: usize) {
    let task = arg as *mut Task;
    #[cfg(target_os = "none")]
    {
        // SAFETY: the scheduler activated this task's address space and
        // installed its kernel stack before first entry; entry/stack
        // come from the validated user image.
        unsafe {
            let t = &*task;
            crate::arch::x86_64::usermode::enter_user_mode(t.user_entry, t.user_stack);
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = task;
        unreachable!("user tasks cannot run on the host");
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    extern "C" fn noop(_arg: usize) {}

    #[test]
    fn time_slices_follow_bands() {
        assert_eq!(time_slice_for(0), 1);
        assert_eq!(time_slice_for(7), 1);
        assert_eq!(time_slice_for(8), 2);
        assert_eq!(time_slice_for(20), 4);
        assert_eq!(time_slice_for(24), 8);
        assert_eq!(time_slice_for(31), 1);
    }

    #[test]
    fn kernel_task_has_prepared_stack() {
        let t = Task::new_kernel("worker", noop, 7, DEFAULT_PRIORITY);
        assert_ne!(t.kernel_rsp, 0);
        assert!(t.kernel_rsp < t.kernel_stack_top());
        assert!(t.kernel_rsp > t.kernel_stack_top() - 128);
        assert_eq!(t.quantum, 4);
        assert_eq!(t.state, TaskState::Ready);
        assert!(t.prev.is_null() && t.next.is_null());
    }

    #[test]
    fn idle_task_is_pinned_lowest() {
        let t = Task::new_idle(3);
        assert!(t.pinned);
        assert_eq!(t.priority, 31);
        assert_eq!(t.cpu, 3);
    }

    #[test]
    fn tids_are_unique() {
        let a = Task::new_kernel("a", noop, 0, 20);
        let b = Task::new_kernel("b", noop, 0, 20);
        assert_ne!(a.tid, b.tid);
    }
}
