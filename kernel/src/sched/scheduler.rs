//! Per-CPU preemptive scheduler.
//!
//! Each CPU owns a priority run queue, a current task and an idle task.
//! Dispatch is priority-then-FIFO from the local queue; an empty queue
//! triggers one work-stealing attempt against the busiest peer before
//! falling back to idle. Quanta are enforced with a one-shot timer that
//! is re-armed whenever a task becomes current.
//!
//! Lock ordering: IRQ disable → endpoint/subsystem lock → a CPU's
//! scheduler lock. The scheduler lock is never held while taking any
//! other lock except a *peer* CPU's lock via `try_lock` (stealing),
//! which cannot deadlock.

use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::Once;

use super::queue::{RunQueue, TaskList};
use super::task::{Task, TaskPtr, TaskState};
use crate::arch;
use crate::config::{MAX_CPUS, PRIORITY_LEVELS, STEAL_BATCH_SIZE, STEAL_MIN_QUEUE};
use crate::mm::Mapper;
use crate::sync::IrqMutex;

/// Hardware services the scheduler depends on, injected at init so the
/// timer/IPI plumbing stays out of the scheduling logic (and so tests
/// can substitute a recording fake).
pub trait Platform: Send + Sync {
    fn cpu_id(&self) -> u32;
    fn cpu_count(&self) -> u32;
    /// Arm a one-shot timer `ticks` milliseconds out.
    fn arm_timer_oneshot(&self, ticks: u32);
    fn disarm_timer(&self);
    fn send_resched_ipi(&self, cpu: u32);
    /// Install the kernel stack used for ring transitions on `cpu`.
    fn set_kernel_stack(&self, cpu: u32, rsp: u64);
}

struct CpuRq {
    queue: RunQueue,
    current: *mut Task,
    idle: *mut Task,
    /// Task switched away from, pending its on_cpu clear.
    prev: *mut Task,
}

// SAFETY: the raw task pointers are only dereferenced under this CPU's
// lock (or by the owning CPU itself).
unsafe impl Send for CpuRq {}

struct CpuSched {
    inner: IrqMutex<CpuRq>,
    need_resched: AtomicBool,
    /// Mirror of queue length for lock-free victim selection.
    nr_running: AtomicUsize,
    ticks: AtomicU64,
    dispatches: AtomicU64,
    steals: AtomicU64,
}

impl CpuSched {
    const fn new() -> Self {
        Self {
            inner: IrqMutex::new(CpuRq {
                queue: RunQueue::new(),
                current: core::ptr::null_mut(),
                idle: core::ptr::null_mut(),
                prev: core::ptr::null_mut(),
            }),
            need_resched: AtomicBool::new(false),
            nr_running: AtomicUsize::new(0),
            ticks: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
            steals: AtomicU64::new(0),
        }
    }
}

static CPUS: [CpuSched; MAX_CPUS] = {
    const INIT: CpuSched = CpuSched::new();
    [INIT; MAX_CPUS]
};

static PLATFORM: Once<&'static dyn Platform> = Once::new();
static MAPPER: Once<&'static dyn Mapper> = Once::new();
static ONLINE_CPUS: AtomicU32 = AtomicU32::new(1);
static NEXT_SPAWN_CPU: AtomicU32 = AtomicU32::new(0);

/// Dead tasks with no outstanding references, awaiting the reaper.
static DEAD_TASKS: IrqMutex<TaskList> = IrqMutex::new(TaskList::new());

/// Install the platform and mapper. Must precede any other call.
pub fn init(platform: &'static dyn Platform, mapper: &'static dyn Mapper) {
    PLATFORM.call_once(|| platform);
    MAPPER.call_once(|| mapper);
}

fn platform() -> &'static dyn Platform {
    *PLATFORM.get().expect("scheduler used before init")
}

/// The task currently executing on this CPU.
pub fn current() -> Option<TaskPtr> {
    let cpu = arch::cpu_id() as usize;
    let rq = CPUS[cpu].inner.lock();
    NonNull::new(rq.current).map(TaskPtr::new)
}

/// Pid of the current task, 0 for kernel tasks and early boot.
pub fn current_pid() -> super::task::Pid {
    match current() {
        // SAFETY: the task is current on this CPU; reading its pid is
        // stable.
        Some(t) => unsafe { t.get_mut().pid },
        None => 0,
    }
}

/// Synthesize the boot flow as a task on the BSP and install the idle
/// task, so the first `schedule()` has something to switch from.
pub fn start_on_bsp() {
    let cpu = arch::cpu_id() as usize;
    let idle = Box::leak(Task::new_idle(cpu as u32));
    let boot = Box::leak(Task::new_boot(cpu as u32));
    boot.state = TaskState::Running;
    boot.on_cpu.store(true, Ordering::Relaxed);
    let mut rq = CPUS[cpu].inner.lock();
    rq.idle = idle;
    rq.current = boot;
}

/// AP entry: the trampoline's stack becomes the idle task's context.
pub fn start_on_ap() -> ! {
    let cpu = arch::cpu_id() as usize;
    let idle = Box::leak(Task::new_idle(cpu as u32));
    idle.state = TaskState::Running;
    idle.on_cpu.store(true, Ordering::Relaxed);
    {
        let mut rq = CPUS[cpu].inner.lock();
        rq.idle = idle;
        rq.current = idle;
    }
    ONLINE_CPUS.fetch_max(cpu as u32 + 1, Ordering::Relaxed);
    idle_loop()
}

/// Record how many CPUs participate in spawning/stealing.
pub fn set_online_cpus(count: u32) {
    ONLINE_CPUS.store(count.clamp(1, MAX_CPUS as u32), Ordering::Relaxed);
}

pub fn online_cpus() -> u32 {
    ONLINE_CPUS.load(Ordering::Relaxed)
}

/// Put a new task on a CPU chosen round-robin.
pub fn spawn(task: Box<Task>) -> TaskPtr {
    let cpu = NEXT_SPAWN_CPU.fetch_add(1, Ordering::Relaxed) % online_cpus();
    spawn_on(cpu, task)
}

/// Put a new task on a specific CPU's queue.
pub fn spawn_on(cpu: u32, mut task: Box<Task>) -> TaskPtr {
    task.cpu = cpu;
    task.state = TaskState::Ready;
    let ptr = TaskPtr::new(NonNull::from(Box::leak(task)));
    enqueue_remote(cpu, ptr);
    ptr
}

/// Enqueue on `cpu`, kicking it if it should preempt. The enqueue's
/// memory effects are published by the lock release before the IPI is
/// raised, so the target observes the task on its next `schedule()`.
fn enqueue_remote(cpu: u32, t: TaskPtr) {
    let local = arch::cpu_id();
    let sched = &CPUS[cpu as usize];
    let mut need_ipi = false;
    {
        let mut rq = sched.inner.lock();
        rq.queue.enqueue(t.as_ptr());
        sched.nr_running.store(rq.queue.len(), Ordering::Relaxed);
        if cpu == local {
            // SAFETY: both tasks are kept alive by the scheduler; we
            // hold this CPU's lock.
            let preempts = unsafe {
                let cur = rq.current;
                !cur.is_null() && (cur == rq.idle || t.get_mut().priority < (*cur).priority)
            };
            if preempts {
                sched.need_resched.store(true, Ordering::Release);
            }
        } else {
            need_ipi = true;
        }
    }
    if need_ipi {
        platform().send_resched_ipi(cpu);
    }
}

/// Timer expiry: the current quantum is spent.
pub fn timer_tick() {
    let cpu = arch::cpu_id() as usize;
    let sched = &CPUS[cpu];
    sched.ticks.fetch_add(1, Ordering::Relaxed);
    let rq = sched.inner.lock();
    let cur = rq.current;
    if cur.is_null() {
        return;
    }
    // SAFETY: current is owned by this CPU and we hold its lock.
    unsafe {
        if cur == rq.idle {
            if !rq.queue.is_empty() {
                sched.need_resched.store(true, Ordering::Release);
            }
        } else {
            (*cur).total_ticks += (*cur).quantum as u64;
            (*cur).quantum = 0;
            sched.need_resched.store(true, Ordering::Release);
        }
    }
}

/// Set this CPU's resched flag (reschedule IPI handler).
pub fn set_need_resched() {
    CPUS[arch::cpu_id() as usize]
        .need_resched
        .store(true, Ordering::Release);
}

/// Called on the interrupt-return path and from the idle loop.
pub fn preempt_if_needed() {
    let cpu = arch::cpu_id() as usize;
    if CPUS[cpu].need_resched.load(Ordering::Acquire) {
        schedule();
    }
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    schedule();
}

/// Change the current task's priority and re-slice its quantum. The
/// boot flow uses this to drop into the idle band once bring-up is
/// done, so spawned work outranks it from then on.
pub fn set_current_priority(priority: u8) {
    assert!((priority as usize) < PRIORITY_LEVELS);
    let was = arch::irq_save_disable();
    {
        let cpu = arch::cpu_id() as usize;
        let rq = CPUS[cpu].inner.lock();
        let cur = rq.current;
        if !cur.is_null() {
            // SAFETY: current task on this CPU under its lock; it is
            // running, so it sits on no queue whose level could go
            // stale.
            unsafe {
                (*cur).priority = priority;
                (*cur).refresh_quantum();
            }
        }
    }
    arch::irq_restore(was);
}

/// Block the current task on `wait_channel` and switch away. The
/// caller may instead mark the task blocked itself (under its own
/// lock, to close wake races) and call [`schedule`] directly.
pub fn block_current(wait_channel: usize) {
    let was = arch::irq_save_disable();
    {
        let cpu = arch::cpu_id() as usize;
        let rq = CPUS[cpu].inner.lock();
        let cur = rq.current;
        // SAFETY: current task, our CPU, lock held.
        unsafe {
            (*cur).state = TaskState::Blocked;
            (*cur).wait_channel = wait_channel;
        }
    }
    schedule();
    arch::irq_restore(was);
}

/// Make a blocked task runnable on its assigned CPU.
pub fn wake(t: TaskPtr) {
    let was = arch::irq_save_disable();
    let local = arch::cpu_id();
    // SAFETY: a blocked task's cpu field is stable; for non-blocked
    // tasks the value is only used to pick a lock.
    let target = unsafe { t.get_mut().cpu };
    let sched = &CPUS[target as usize];
    let mut need_ipi = false;
    {
        let mut rq = sched.inner.lock();
        // SAFETY: target CPU lock held; blocked tasks are owned by the
        // wait queue that published this pointer.
        let task = unsafe { t.get_mut() };
        if task.state == TaskState::Blocked {
            task.state = TaskState::Ready;
            task.wait_channel = 0;
            task.refresh_quantum();
            rq.queue.enqueue(t.as_ptr());
            sched.nr_running.store(rq.queue.len(), Ordering::Relaxed);
            if target == local {
                // SAFETY: current pointer valid under this lock.
                let preempts = unsafe {
                    let cur = rq.current;
                    !cur.is_null() && (cur == rq.idle || task.priority < (*cur).priority)
                };
                if preempts {
                    sched.need_resched.store(true, Ordering::Release);
                }
            } else {
                need_ipi = true;
            }
        }
    }
    if need_ipi {
        platform().send_resched_ipi(target);
    }
    arch::irq_restore(was);
}

/// Terminate the current task.
pub fn exit_current() -> ! {
    {
        let cpu = arch::cpu_id() as usize;
        let _was = arch::irq_save_disable();
        let mut rq = CPUS[cpu].inner.lock();
        // SAFETY: current task on this CPU under its lock.
        unsafe {
            (*rq.current).state = TaskState::Dead;
        }
    }
    schedule();
    unreachable!("dead task rescheduled");
}

/// A user task faulted: kill it and force a reschedule. A kernel task
/// faulting is unrecoverable.
pub fn on_user_exception(vector: u8, error: u64, rip: u64, cr2: u64) {
    let cpu = arch::cpu_id() as usize;
    let sched = &CPUS[cpu];
    let rq = sched.inner.lock();
    let cur = rq.current;
    // SAFETY: current task on this CPU under its lock.
    unsafe {
        if cur.is_null() || !(*cur).is_user() {
            panic!(
                "kernel fault: vector {} error {:#x} rip {:#x} cr2 {:#x}",
                vector, error, rip, cr2
            );
        }
        log::warn!(
            "killing task {} ({}): vector {} error {:#x} rip {:#x} cr2 {:#x}",
            (*cur).tid,
            (*cur).name,
            vector,
            error,
            rip,
            cr2
        );
        (*cur).state = TaskState::Dead;
    }
    sched.need_resched.store(true, Ordering::Release);
}

/// Pick and switch to the next task.
pub fn schedule() {
    let was = arch::irq_save_disable();
    let cpu = arch::cpu_id() as usize;
    let sched = &CPUS[cpu];
    let switch: Option<(*mut Task, u64)> = {
        let mut rq = sched.inner.lock();
        sched.need_resched.store(false, Ordering::Release);
        let cur = rq.current;
        if cur.is_null() {
            // Scheduling not started on this CPU yet.
            None
        } else {
            // SAFETY: all task pointers below are kept alive by the
            // scheduler and accessed under this CPU's lock.
            unsafe {
                if (*cur).state == TaskState::Running && cur != rq.idle {
                    (*cur).state = TaskState::Ready;
                    (*cur).refresh_quantum();
                    rq.queue.enqueue(NonNull::new_unchecked(cur));
                }

                let next = match rq.queue.dequeue() {
                    Some(t) => t.as_ptr(),
                    None => match steal_from_peer(cpu, &mut rq) {
                        Some(t) => t.as_ptr(),
                        None => rq.idle,
                    },
                };
                sched.nr_running.store(rq.queue.len(), Ordering::Relaxed);

                if next == cur {
                    (*cur).state = TaskState::Running;
                    arm_timer_for(&rq, cur);
                    None
                } else {
                    (*next).state = TaskState::Running;
                    (*next).on_cpu.store(true, Ordering::Relaxed);
                    (*next).cpu = cpu as u32;
                    rq.current = next;
                    rq.prev = cur;
                    sched.dispatches.fetch_add(1, Ordering::Relaxed);
                    prepare_task_switch(cur, next, cpu as u32);
                    arm_timer_for(&rq, next);
                    Some((cur, (*next).kernel_rsp))
                }
            }
        }
    };
    if let Some((old, new_rsp)) = switch {
        // SAFETY: IRQs are off; `old` is the task running on this very
        // stack and `new_rsp` was saved by a previous switch (or built
        // by prepare_initial_stack). The lock is dropped: `old` cannot
        // be re-dispatched elsewhere until finish_task_switch clears
        // its on_cpu flag after the save completes.
        unsafe {
            crate::arch::x86_64::context::switch_stacks(&mut (*old).kernel_rsp, new_rsp);
        }
        // Running again, possibly on a different CPU than before.
        finish_task_switch();
    }
    arch::irq_restore(was);
}

/// Publish the completion of the switch that brought us on-CPU: the
/// previous task's registers are saved, so it may run elsewhere now.
/// Dead previous tasks move to the reaper list.
pub fn finish_task_switch() {
    let cpu = arch::cpu_id() as usize;
    let sched = &CPUS[cpu];
    let prev = {
        let mut rq = sched.inner.lock();
        core::mem::replace(&mut rq.prev, core::ptr::null_mut())
    };
    if prev.is_null() {
        return;
    }
    // SAFETY: prev was current on this CPU until the switch; its save
    // is complete because we are executing after it.
    unsafe {
        (*prev).on_cpu.store(false, Ordering::Release);
        if (*prev).state == TaskState::Dead
            && (*prev).caller_refs.load(Ordering::Acquire) == 0
        {
            DEAD_TASKS
                .lock()
                .push_back(NonNull::new_unchecked(prev));
        }
    }
}

/// Drop a caller reference; reaps the task if it died while referenced.
pub fn release_caller_ref(t: TaskPtr) {
    // SAFETY: the handle layer guarantees the reference was held.
    unsafe {
        let task = t.get_mut();
        if task.caller_refs.fetch_sub(1, Ordering::AcqRel) == 1
            && task.state == TaskState::Dead
            && !task.on_cpu.load(Ordering::Acquire)
        {
            DEAD_TASKS.lock().push_back(t.as_ptr());
        }
    }
}

/// Free dead tasks. Runs in the idle loop, never in IRQ context.
pub fn reap_dead() {
    loop {
        let task = DEAD_TASKS.lock().pop_front();
        match task {
            // SAFETY: dead, off-CPU, unreferenced tasks are exclusively
            // ours; they were leaked at spawn.
            Some(t) => unsafe { drop(Box::from_raw(t.as_ptr())) },
            None => break,
        }
    }
}

/// One work-stealing attempt: raid the busiest peer whose queue holds
/// at least [`STEAL_MIN_QUEUE`] tasks, taking up to
/// [`STEAL_BATCH_SIZE`] from the tail of its hottest levels.
fn steal_from_peer(cpu: usize, rq: &mut CpuRq) -> Option<NonNull<Task>> {
    let online = online_cpus() as usize;
    let mut victim = None;
    let mut victim_len = STEAL_MIN_QUEUE - 1;
    for peer in 0..online.min(MAX_CPUS) {
        if peer == cpu {
            continue;
        }
        let len = CPUS[peer].nr_running.load(Ordering::Relaxed);
        if len > victim_len {
            victim = Some(peer);
            victim_len = len;
        }
    }
    let victim = victim?;
    let vsched = &CPUS[victim];
    // try_lock only: spinning on a peer's lock from inside our own
    // critical section invites lock-order deadlock.
    let mut vrq = vsched.inner.try_lock()?;
    let mut out = [None; STEAL_BATCH_SIZE];
    let n = vrq.queue.steal_batch(STEAL_BATCH_SIZE, &mut out);
    vsched.nr_running.store(vrq.queue.len(), Ordering::Relaxed);
    drop(vrq);
    if n == 0 {
        return None;
    }
    let sched = &CPUS[cpu];
    sched.steals.fetch_add(n as u64, Ordering::Relaxed);
    for slot in out.iter().take(n) {
        let t = slot.unwrap();
        // SAFETY: stolen tasks are off the victim's queue and not
        // running; we own them now.
        unsafe {
            (*t.as_ptr()).cpu = cpu as u32;
        }
        rq.queue.enqueue(t);
    }
    rq.queue.dequeue()
}

/// Arm (or disarm) the quantum timer for the task becoming current.
fn arm_timer_for(rq: &CpuRq, task: *mut Task) {
    if task == rq.idle {
        if rq.queue.is_empty() {
            platform().disarm_timer();
        } else {
            platform().arm_timer_oneshot(1);
        }
    } else {
        // SAFETY: task pointer valid under the held CPU lock.
        let quantum = unsafe { (*task).quantum.max(1) };
        platform().arm_timer_oneshot(quantum);
    }
}

/// Swap address space and user-mode machine state around a switch.
fn prepare_task_switch(old: *mut Task, next: *mut Task, cpu: u32) {
    // SAFETY: both tasks are alive and this CPU's lock is held.
    unsafe {
        if (*old).is_user() {
            save_user_arch_state(&mut (*old).arch);
        }
        match (*next).address_space.as_ref() {
            Some(space) => space.activate(),
            None => {
                if (*old).is_user() {
                    if let Some(mapper) = MAPPER.get() {
                        mapper.activate(mapper.kernel_root());
                    }
                }
            }
        }
        if (*next).is_user() {
            load_user_arch_state(&(*next).arch);
            platform().set_kernel_stack(cpu, (*next).kernel_stack_top());
        }
    }
}

#[cfg(target_os = "none")]
fn save_user_arch_state(state: &mut super::task::ArchTaskState) {
    use x86_64::registers::model_specific::{FsBase, KernelGsBase};
    state.user_fs_base = FsBase::read().as_u64();
    // While in the kernel, the user GS base sits in KERNEL_GS_BASE
    // (swapped on entry).
    state.user_gs_base = KernelGsBase::read().as_u64();
}

#[cfg(not(target_os = "none"))]
fn save_user_arch_state(_state: &mut super::task::ArchTaskState) {}

#[cfg(target_os = "none")]
fn load_user_arch_state(state: &super::task::ArchTaskState) {
    use x86_64::registers::model_specific::{FsBase, KernelGsBase};
    use x86_64::VirtAddr;
    FsBase::write(VirtAddr::new(state.user_fs_base));
    KernelGsBase::write(VirtAddr::new(state.user_gs_base));
}

#[cfg(not(target_os = "none"))]
fn load_user_arch_state(_state: &super::task::ArchTaskState) {}

/// Body of every per-CPU idle task.
pub extern "C" fn idle_task_entry(_cpu: usize) {
    idle_loop()
}

fn idle_loop() -> ! {
    loop {
        reap_dead();
        preempt_if_needed();
        arch::wait_for_interrupt();
    }
}

/// Per-CPU dispatch counter (steady-state balance checks).
pub fn dispatch_count(cpu: u32) -> u64 {
    CPUS[cpu as usize].dispatches.load(Ordering::Relaxed)
}

/// Per-CPU steal counter.
pub fn steal_count(cpu: u32) -> u64 {
    CPUS[cpu as usize].steals.load(Ordering::Relaxed)
}

/// Per-CPU tick counter.
pub fn tick_count(cpu: u32) -> u64 {
    CPUS[cpu as usize].ticks.load(Ordering::Relaxed)
}
