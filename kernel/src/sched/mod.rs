//! Preemptive SMP scheduler.

pub mod queue;
pub mod scheduler;
pub mod task;

pub use scheduler::{
    block_current, current, current_pid, dispatch_count, exit_current, finish_task_switch, init,
    idle_task_entry, on_user_exception, online_cpus, preempt_if_needed, reap_dead,
    release_caller_ref, schedule, set_current_priority, set_need_resched, set_online_cpus, spawn,
    spawn_on, start_on_ap, start_on_bsp, steal_count, tick_count, timer_tick, wake, yield_now,
    Platform,
};
pub use task::{Pid, Task, TaskPtr, TaskState, Tid};
