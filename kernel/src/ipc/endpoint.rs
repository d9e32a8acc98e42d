//! Rendezvous endpoints.
//!
//! Synchronous message passing with no kernel-owned buffers: sender and
//! receiver meet at the endpoint and the message is copied directly
//! between their per-task IPC slots. Wait queues reuse the tasks'
//! intrusive links, which is safe because a blocked task is never on a run
//! queue at the same time.
//!
//! Lock ordering: IRQ disable → endpoint lock → (inside `wake`) the
//! target CPU's scheduler lock. The scheduler lock is never held while
//! taking an endpoint lock.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use super::error::{IpcError, Result};
use super::message::{Message, TAG_FLAG_CALL};
use crate::sched::queue::TaskList;
use crate::sched::task::{IpcWaitStatus, TaskPtr, TaskState};
use crate::sched;
use crate::sync::IrqMutex;

/// Global IPC counters.
pub struct IpcCounters {
    pub sends: AtomicU64,
    pub receives: AtomicU64,
    pub calls: AtomicU64,
    pub notifies: AtomicU64,
    /// Direct handoffs (a waiter was present at the rendezvous).
    pub direct_handoffs: AtomicU64,
}

pub static IPC_COUNTERS: IpcCounters = IpcCounters {
    sends: AtomicU64::new(0),
    receives: AtomicU64::new(0),
    calls: AtomicU64::new(0),
    notifies: AtomicU64::new(0),
    direct_handoffs: AtomicU64::new(0),
};

struct EndpointInner {
    alive: bool,
    /// Tasks blocked in `send`/`call` with their message in their slot.
    send_queue: TaskList,
    /// Tasks blocked in `receive`.
    recv_queue: TaskList,
    pending_notifications: u64,
}

/// One rendezvous endpoint.
pub struct Endpoint {
    pub id: u32,
    inner: IrqMutex<EndpointInner>,
}

impl Endpoint {
    pub fn new(id: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: IrqMutex::new(EndpointInner {
                alive: true,
                send_queue: TaskList::new(),
                recv_queue: TaskList::new(),
                pending_notifications: 0,
            }),
        })
    }

    fn wait_channel(&self) -> usize {
        self as *const Self as usize
    }

    /// Fire-and-forget send. Blocks until a receiver takes the message.
    pub fn send(&self, cur: TaskPtr, msg: Message) -> Result<()> {
        IPC_COUNTERS.sends.fetch_add(1, Ordering::Relaxed);
        let receiver = {
            let mut inner = self.inner.lock();
            if !inner.alive {
                return Err(IpcError::EndpointClosed);
            }
            match inner.recv_queue.pop_front() {
                Some(rcv) => {
                    // SAFETY: rcv is blocked on our queue; the endpoint
                    // lock serializes access to its IPC slot.
                    unsafe {
                        let r = &mut *rcv.as_ptr();
                        r.ipc.message = msg;
                        r.ipc.caller = None;
                        r.ipc.status = IpcWaitStatus::Ok;
                    }
                    IPC_COUNTERS.direct_handoffs.fetch_add(1, Ordering::Relaxed);
                    Some(TaskPtr::new(rcv))
                }
                None => {
                    // SAFETY: cur is the running task; marking it
                    // blocked under the endpoint lock closes the
                    // wake-before-sleep race.
                    unsafe {
                        let c = cur.get_mut();
                        c.ipc.message = msg;
                        c.ipc.caller = None;
                        c.ipc.waiting_for_reply = false;
                        c.ipc.status = IpcWaitStatus::Ok;
                        c.state = TaskState::Blocked;
                        c.wait_channel = self.wait_channel();
                    }
                    inner.send_queue.push_back(cur.as_ptr());
                    None
                }
            }
        };
        match receiver {
            Some(rcv) => {
                sched::wake(rcv);
                Ok(())
            }
            None => {
                sched::schedule();
                // SAFETY: we are running again; our slot was written by
                // whoever woke us.
                match unsafe { cur.get_mut().ipc.status } {
                    IpcWaitStatus::Ok => Ok(()),
                    IpcWaitStatus::Closed => Err(IpcError::EndpointClosed),
                }
            }
        }
    }

    /// Receive a message. Returns the caller task when the sender
    /// performed a call and is parked awaiting a reply.
    pub fn receive(&self, cur: TaskPtr) -> Result<(Message, Option<TaskPtr>)> {
        IPC_COUNTERS.receives.fetch_add(1, Ordering::Relaxed);
        enum Outcome {
            Ready(Message, Option<TaskPtr>, Option<TaskPtr>),
            Blocked,
        }
        let outcome = {
            let mut inner = self.inner.lock();
            if !inner.alive {
                return Err(IpcError::EndpointClosed);
            }
            if inner.pending_notifications > 0 {
                let count = inner.pending_notifications;
                inner.pending_notifications -= 1;
                Outcome::Ready(Message::notification(count), None, None)
            } else if let Some(snd) = inner.send_queue.pop_front() {
                // SAFETY: snd is blocked on our queue under our lock.
                let (msg, caller, wake_sender) = unsafe {
                    let s = &mut *snd.as_ptr();
                    let msg = s.ipc.message;
                    if s.ipc.waiting_for_reply {
                        // Caller stays blocked until the reply.
                        (msg, Some(TaskPtr::new(snd)), None)
                    } else {
                        (msg, None, Some(TaskPtr::new(snd)))
                    }
                };
                Outcome::Ready(msg, caller, wake_sender)
            } else {
                // SAFETY: cur is the running task, blocked under the
                // endpoint lock (lost-wake rule).
                unsafe {
                    let c = cur.get_mut();
                    c.ipc.caller = None;
                    c.ipc.status = IpcWaitStatus::Ok;
                    c.state = TaskState::Blocked;
                    c.wait_channel = self.wait_channel();
                }
                inner.recv_queue.push_back(cur.as_ptr());
                Outcome::Blocked
            }
        };
        match outcome {
            Outcome::Ready(msg, caller, wake_sender) => {
                if let Some(snd) = wake_sender {
                    sched::wake(snd);
                }
                Ok((msg, caller))
            }
            Outcome::Blocked => {
                sched::schedule();
                // SAFETY: running again, slot filled by the waker.
                unsafe {
                    let c = cur.get_mut();
                    match c.ipc.status {
                        IpcWaitStatus::Ok => Ok((c.ipc.message, c.ipc.caller.take())),
                        IpcWaitStatus::Closed => Err(IpcError::EndpointClosed),
                    }
                }
            }
        }
    }

    /// Send and wait for the reply in one rendezvous.
    pub fn call(&self, cur: TaskPtr, msg: Message) -> Result<Message> {
        IPC_COUNTERS.calls.fetch_add(1, Ordering::Relaxed);
        let mut msg = msg;
        msg.tag = super::message::Tag::new(
            msg.tag.label(),
            msg.tag.length(),
            msg.tag.flags() | TAG_FLAG_CALL,
        );
        let receiver = {
            let mut inner = self.inner.lock();
            if !inner.alive {
                return Err(IpcError::EndpointClosed);
            }
            // SAFETY: cur is the running task; endpoint lock held.
            unsafe {
                let c = cur.get_mut();
                c.ipc.message = msg;
                c.ipc.caller = None;
                c.ipc.waiting_for_reply = true;
                c.ipc.status = IpcWaitStatus::Ok;
                c.state = TaskState::Blocked;
                c.wait_channel = self.wait_channel();
            }
            match inner.recv_queue.pop_front() {
                Some(rcv) => {
                    // Direct handoff: the receiver gets our message and
                    // our identity; we stay blocked awaiting the reply.
                    // SAFETY: rcv blocked on our queue under our lock.
                    unsafe {
                        let r = &mut *rcv.as_ptr();
                        r.ipc.message = msg;
                        r.ipc.caller = Some(cur);
                        r.ipc.status = IpcWaitStatus::Ok;
                    }
                    Some(TaskPtr::new(rcv))
                }
                None => {
                    inner.send_queue.push_back(cur.as_ptr());
                    None
                }
            }
        };
        if let Some(rcv) = receiver {
            sched::wake(rcv);
        }
        sched::schedule();
        // SAFETY: running again; the reply (or close) wrote our slot.
        unsafe {
            let c = cur.get_mut();
            match c.ipc.status {
                IpcWaitStatus::Ok => Ok(c.ipc.message),
                IpcWaitStatus::Closed => {
                    c.ipc.waiting_for_reply = false;
                    Err(IpcError::EndpointClosed)
                }
            }
        }
    }

    /// Post a notification; never blocks.
    pub fn notify(&self) -> Result<()> {
        IPC_COUNTERS.notifies.fetch_add(1, Ordering::Relaxed);
        let receiver = {
            let mut inner = self.inner.lock();
            if !inner.alive {
                return Err(IpcError::EndpointClosed);
            }
            match inner.recv_queue.pop_front() {
                Some(rcv) => {
                    // SAFETY: rcv blocked on our queue under our lock.
                    unsafe {
                        let r = &mut *rcv.as_ptr();
                        r.ipc.message = Message::notification(1);
                        r.ipc.caller = None;
                        r.ipc.status = IpcWaitStatus::Ok;
                    }
                    Some(TaskPtr::new(rcv))
                }
                None => {
                    inner.pending_notifications += 1;
                    None
                }
            }
        };
        if let Some(rcv) = receiver {
            sched::wake(rcv);
        }
        Ok(())
    }

    /// Number of undelivered notifications.
    pub fn pending_notifications(&self) -> u64 {
        self.inner.lock().pending_notifications
    }

    /// Kill the endpoint: mark dead and wake every waiter with a
    /// closed status. Their in-flight syscalls fail with `PIPE`.
    pub fn begin_close(&self) {
        let mut drained = [None::<TaskPtr>; 64];
        loop {
            let mut count = 0;
            {
                let mut inner = self.inner.lock();
                inner.alive = false;
                while count < drained.len() {
                    let t = match inner.send_queue.pop_front() {
                        Some(t) => t,
                        None => match inner.recv_queue.pop_front() {
                            Some(t) => t,
                            None => break,
                        },
                    };
                    // SAFETY: drained tasks were blocked on our queues.
                    unsafe {
                        let task = &mut *t.as_ptr();
                        task.ipc.status = IpcWaitStatus::Closed;
                        task.ipc.waiting_for_reply = false;
                    }
                    drained[count] = Some(TaskPtr::new(t));
                    count += 1;
                }
            }
            if count == 0 {
                break;
            }
            for t in drained.iter().take(count).flatten() {
                sched::wake(*t);
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.inner.lock().alive
    }

    /// Waiter counts, for diagnostics.
    pub fn queue_depths(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.send_queue.len(), inner.recv_queue.len())
    }
}

/// Deliver a reply directly into a parked caller's slot and wake it.
/// Non-blocking; used by `ipc_reply` through a caller handle.
pub fn reply_to(caller: TaskPtr, msg: Message) -> Result<()> {
    // SAFETY: the caller handle guarantees the task exists and is
    // parked waiting for a reply; nothing else touches its slot.
    unsafe {
        let t = caller.get_mut();
        if !t.ipc.waiting_for_reply {
            return Err(IpcError::BadMessage);
        }
        t.ipc.message = msg;
        t.ipc.waiting_for_reply = false;
        t.ipc.status = IpcWaitStatus::Ok;
    }
    sched::wake(caller);
    Ok(())
}

/// Abort a parked caller: wake it with a closed status. Used when its
/// reply capability is destroyed without a reply (copy-out failure,
/// receiver teardown).
pub fn abort_caller(caller: TaskPtr) {
    // SAFETY: as in `reply_to`.
    let parked = unsafe {
        let t = caller.get_mut();
        if t.ipc.waiting_for_reply {
            t.ipc.waiting_for_reply = false;
            t.ipc.status = IpcWaitStatus::Closed;
            true
        } else {
            false
        }
    };
    if parked {
        sched::wake(caller);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::sched::task::Task;
    use alloc::boxed::Box;
    use core::ptr::NonNull;

    extern "C" fn noop(_arg: usize) {}

    /// Tasks are pinned to a per-test CPU so concurrent tests never
    /// share a run queue (wakes enqueue on the task's CPU).
    fn parked_task(name: &str, cpu: u32) -> TaskPtr {
        crate::sched::scheduler::tests::ensure_test_init();
        let mut t = Task::new_kernel(name, noop, 0, 20);
        t.cpu = cpu;
        // Start blocked: on the host nothing actually runs, so a task
        // that was woken is distinguishable (Ready, on a run queue).
        t.state = TaskState::Blocked;
        TaskPtr::new(NonNull::from(Box::leak(t)))
    }

    /// Detach a task from whatever run queue a wake put it on, so the
    /// test can free it.
    fn unpark_and_free(t: TaskPtr) {
        crate::sched::scheduler::tests::detach(t);
        // SAFETY: now off every list; the test owns the leaked box.
        unsafe { drop(Box::from_raw(t.as_ptr().as_ptr())) };
    }

    #[test]
    fn send_rendezvous_with_blocked_receiver() {
        let ep = Endpoint::new(1);
        let rcv = parked_task("rcv", 13);
        let snd = parked_task("snd", 13);

        // Receiver arrives first and blocks (schedule() is inert on the
        // host, so the call returns with the task parked).
        // Simulate by performing the blocking receive path directly:
        let r = ep.receive(rcv);
        // Host quirk: the blocked receive "returns" immediately with
        // whatever is in the slot; what matters is the queue state.
        let _ = r;
        assert_eq!(ep.queue_depths(), (0, 1));

        let msg = Message::new(0x41, 1, 0).with_data(0, 0x1234);
        ep.send(snd, msg).unwrap();
        assert_eq!(ep.queue_depths(), (0, 0));
        // SAFETY: test owns both tasks.
        unsafe {
            assert_eq!(rcv.get_mut().ipc.message.tag.label(), 0x41);
            assert_eq!(rcv.get_mut().ipc.message.data[0], 0x1234);
            assert!(rcv.get_mut().ipc.caller.is_none());
        }
        unpark_and_free(rcv);
        unpark_and_free(snd);
    }

    #[test]
    fn receive_finds_queued_sender() {
        let ep = Endpoint::new(2);
        let snd = parked_task("snd", 14);
        let rcv = parked_task("rcv", 14);

        let msg = Message::new(0x77, 2, 0).with_data(0, 1).with_data(1, 2);
        ep.send(snd, msg).unwrap();
        assert_eq!(ep.queue_depths(), (1, 0));

        let (got, caller) = ep.receive(rcv).unwrap();
        assert_eq!(got.tag.label(), 0x77);
        assert_eq!(got.data[..2], [1, 2]);
        // Plain send: no caller handle, sender was woken.
        assert!(caller.is_none());
        assert_eq!(ep.queue_depths(), (0, 0));
        unpark_and_free(snd);
        unpark_and_free(rcv);
    }

    #[test]
    fn call_parks_caller_until_reply() {
        let ep = Endpoint::new(3);
        let caller = parked_task("caller", 15);
        let server = parked_task("server", 15);

        let req = Message::new(0x41, 0, 0).with_data(0, 0x1234);
        // Host: call() enqueues and "returns" straight through the
        // inert schedule; the caller task is left parked on the queue.
        let _ = ep.call(caller, req);
        assert_eq!(ep.queue_depths(), (1, 0));

        let (got, who) = ep.receive(server).unwrap();
        assert_eq!(got.tag.label(), 0x41);
        assert_ne!(got.tag.flags() & TAG_FLAG_CALL, 0);
        let who = who.expect("caller identity lost");
        assert_eq!(who, caller);
        // Caller still blocked, waiting for reply, on no queue.
        // SAFETY: test owns the task.
        unsafe {
            assert!(who.get_mut().ipc.waiting_for_reply);
            assert_eq!(who.get_mut().state, TaskState::Blocked);
        }

        let reply = Message::new(0x42, 1, 0).with_data(0, 0x5678);
        reply_to(who, reply).unwrap();
        // SAFETY: test owns the task.
        unsafe {
            assert!(!caller.get_mut().ipc.waiting_for_reply);
            assert_eq!(caller.get_mut().ipc.message.tag.label(), 0x42);
            assert_eq!(caller.get_mut().ipc.message.data[0], 0x5678);
            assert_eq!(caller.get_mut().state, TaskState::Ready);
        }
        // Replying twice is rejected.
        assert_eq!(reply_to(who, reply), Err(IpcError::BadMessage));
        unpark_and_free(caller);
        unpark_and_free(server);
    }

    #[test]
    fn notify_coalesces_and_never_blocks() {
        let ep = Endpoint::new(4);
        ep.notify().unwrap();
        ep.notify().unwrap();
        ep.notify().unwrap();
        assert_eq!(ep.pending_notifications(), 3);

        let rcv = parked_task("rcv", 5);
        let (msg, caller) = ep.receive(rcv).unwrap();
        assert!(msg.is_notification());
        assert_eq!(msg.tag.length(), 1);
        assert_eq!(msg.data[0], 3);
        assert!(caller.is_none());
        assert_eq!(ep.pending_notifications(), 2);
        unpark_and_free(rcv);
    }

    #[test]
    fn notify_hands_off_to_blocked_receiver() {
        let ep = Endpoint::new(5);
        let rcv = parked_task("rcv", 5);
        let _ = ep.receive(rcv);
        assert_eq!(ep.queue_depths(), (0, 1));
        ep.notify().unwrap();
        assert_eq!(ep.pending_notifications(), 0);
        // SAFETY: test owns the task.
        unsafe {
            assert!(rcv.get_mut().ipc.message.is_notification());
            assert_eq!(rcv.get_mut().ipc.message.data[0], 1);
        }
        unpark_and_free(rcv);
    }

    #[test]
    fn close_drains_senders_with_closed_status() {
        let ep = Endpoint::new(6);
        let snd = parked_task("snd", 6);
        let caller = parked_task("caller", 6);

        let _ = ep.send(snd, Message::new(1, 0, 0));
        let _ = ep.call(caller, Message::new(2, 0, 0));
        assert_eq!(ep.queue_depths(), (2, 0));

        ep.begin_close();
        assert!(!ep.is_alive());
        assert_eq!(ep.queue_depths(), (0, 0));
        // SAFETY: test owns the tasks.
        unsafe {
            assert_eq!(snd.get_mut().ipc.status, IpcWaitStatus::Closed);
            assert_eq!(caller.get_mut().ipc.status, IpcWaitStatus::Closed);
            // Queued callers must not be left hanging for a reply.
            assert!(!caller.get_mut().ipc.waiting_for_reply);
        }

        // Every operation after destruction fails with EndpointClosed.
        assert_eq!(
            ep.send(snd, Message::new(3, 0, 0)),
            Err(IpcError::EndpointClosed)
        );
        assert_eq!(ep.notify(), Err(IpcError::EndpointClosed));

        for t in [snd, caller] {
            unpark_and_free(t);
        }
    }

    #[test]
    fn close_drains_blocked_receiver() {
        let ep = Endpoint::new(7);
        let rcv = parked_task("rcv", 4);
        let _ = ep.receive(rcv);
        assert_eq!(ep.queue_depths(), (0, 1));
        ep.begin_close();
        assert_eq!(ep.queue_depths(), (0, 0));
        // SAFETY: test owns the task.
        unsafe {
            assert_eq!(rcv.get_mut().ipc.status, IpcWaitStatus::Closed);
            assert_eq!(rcv.get_mut().state, TaskState::Ready);
        }
        assert!(matches!(
            ep.receive(rcv),
            Err(IpcError::EndpointClosed)
        ));
        unpark_and_free(rcv);
    }
}
