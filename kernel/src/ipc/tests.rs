//! Cross-component IPC tests: registry, endpoints and handle tables
//! driven together the way the syscall layer composes them.

#![cfg(all(test, not(target_os = "none")))]

use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use super::endpoint::{abort_caller, reply_to};
use super::handle::{HandleKind, HandleObject, HandleTable, Rights};
use super::message::{Message, TAG_FLAG_CALL};
use super::{registry, IpcError};
use crate::sched::task::{IpcWaitStatus, Task, TaskState};
use crate::sched::{self, TaskPtr};

extern "C" fn noop(_arg: usize) {}

fn parked_task(name: &str, cpu: u32) -> TaskPtr {
    crate::sched::scheduler::tests::ensure_test_init();
    let mut t = Task::new_kernel(name, noop, 0, 20);
    t.cpu = cpu;
    t.state = TaskState::Blocked;
    TaskPtr::new(NonNull::from(Box::leak(t)))
}

fn unpark_and_free(t: TaskPtr) {
    crate::sched::scheduler::tests::detach(t);
    // SAFETY: off every list; the test owns the leaked box.
    unsafe { drop(Box::from_raw(t.as_ptr().as_ptr())) };
}

/// The full call/reply choreography: a client calls through its
/// endpoint handle, the server receives a reply capability, uses it
/// once, and the capability dies with the reply.
#[test]
fn call_reply_consumes_the_reply_capability() {
    let client = parked_task("client", 2);
    let server = parked_task("server", 2);

    // Owner (pid 40) creates the endpoint and holds the full-rights
    // handle; the client's table gets a send|call grant.
    let (token, ep) = registry::create(40).unwrap();
    let mut server_handles = HandleTable::new();
    let h_srv = server_handles
        .install(
            HandleKind::Endpoint,
            Rights::ENDPOINT_DEFAULT,
            HandleObject::Endpoint(token),
        )
        .unwrap();
    let mut client_handles = HandleTable::new();
    let h_cli = client_handles
        .install(
            HandleKind::Endpoint,
            Rights::SEND | Rights::CALL,
            HandleObject::Endpoint(token),
        )
        .unwrap();

    // Client: resolve handle, then call. (The inert host scheduler
    // leaves the client parked on the endpoint.)
    let HandleObject::Endpoint(cli_token) = client_handles
        .lookup(h_cli, HandleKind::Endpoint, Rights::CALL)
        .unwrap()
    else {
        panic!("wrong object kind");
    };
    let cli_ep = registry::acquire(cli_token).unwrap();
    let req = Message::new(0x41, 1, 0).with_data(0, 0x1234);
    let _ = cli_ep.call(client, req);

    // Server: resolve its handle, receive, mint the reply capability.
    let HandleObject::Endpoint(srv_token) = server_handles
        .lookup(h_srv, HandleKind::Endpoint, Rights::RECEIVE)
        .unwrap()
    else {
        panic!("wrong object kind");
    };
    let srv_ep = registry::acquire(srv_token).unwrap();
    let (got, who) = srv_ep.receive(server).unwrap();
    assert_eq!(got.tag.label(), 0x41);
    assert_eq!(got.data[0], 0x1234);
    assert_ne!(got.tag.flags() & TAG_FLAG_CALL, 0);
    let who = who.expect("caller lost at rendezvous");

    // SAFETY: the caller is parked awaiting the reply.
    unsafe {
        who.get_mut().caller_refs.fetch_add(1, Ordering::AcqRel);
    }
    let h_caller = server_handles
        .install(HandleKind::Caller, Rights::REPLY, HandleObject::Caller(who))
        .unwrap();

    // Reply: consume the handle first, then deliver.
    let HandleObject::Caller(target) = server_handles.free(h_caller).unwrap() else {
        panic!("wrong object kind");
    };
    reply_to(target, Message::new(0x42, 1, 0).with_data(0, 0x5678)).unwrap();
    sched::release_caller_ref(target);

    // The client resumed with the reply in its slot.
    // SAFETY: test owns the task.
    unsafe {
        let c = client.get_mut();
        assert_eq!(c.ipc.message.tag.label(), 0x42);
        assert_eq!(c.ipc.message.data[0], 0x5678);
        assert_eq!(c.state, TaskState::Ready);
    }
    // The consumed capability no longer resolves.
    assert_eq!(
        server_handles.lookup(h_caller, HandleKind::Caller, Rights::REPLY),
        Err(IpcError::InvalidHandle)
    );

    registry::destroy(token, 40).unwrap();
    drop(ep);
    unpark_and_free(client);
    unpark_and_free(server);
}

/// Destroying a live endpoint through the registry wakes a queued
/// caller with a closed status and stales every token.
#[test]
fn registry_destroy_unblocks_queued_caller() {
    let caller = parked_task("caller", 3);
    let (token, ep) = registry::create(41).unwrap();

    let _ = ep.call(caller, Message::new(0x99, 0, 0));
    assert_eq!(ep.queue_depths(), (1, 0));

    registry::destroy(token, 41).unwrap();
    assert!(registry::acquire(token).is_none());
    assert!(!ep.is_alive());
    // SAFETY: test owns the task.
    unsafe {
        assert_eq!(caller.get_mut().ipc.status, IpcWaitStatus::Closed);
        assert!(!caller.get_mut().ipc.waiting_for_reply);
        assert_eq!(caller.get_mut().state, TaskState::Ready);
    }
    // Late operations observe the closure.
    assert_eq!(ep.notify(), Err(IpcError::EndpointClosed));
    unpark_and_free(caller);
}

/// An aborted caller (reply right destroyed without a reply) is woken
/// with the closed status instead of hanging.
#[test]
fn aborted_caller_does_not_hang() {
    let caller = parked_task("caller", 8);
    let server = parked_task("server", 8);
    let (token, ep) = registry::create(42).unwrap();

    let _ = ep.call(caller, Message::new(0x11, 0, 0));
    let (_msg, who) = ep.receive(server).unwrap();
    let who = who.unwrap();

    abort_caller(who);
    // SAFETY: test owns the task.
    unsafe {
        assert_eq!(caller.get_mut().ipc.status, IpcWaitStatus::Closed);
        assert_eq!(caller.get_mut().state, TaskState::Ready);
    }
    // Aborting twice is harmless.
    abort_caller(who);

    registry::destroy(token, 42).unwrap();
    drop(ep);
    unpark_and_free(caller);
    unpark_and_free(server);
}
