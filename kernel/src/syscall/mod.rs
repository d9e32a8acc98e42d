//! Syscall dispatch.
//!
//! The architectural entry stub materializes a [`SyscallFrame`] on the
//! current task's kernel stack and calls [`dispatch_frame`]; the
//! frame's `rax` slot carries the syscall number in and the result
//! out. Results are non-negative values; errors are encoded as the
//! two's-complement negation of an [`Errno`] code, applied here and
//! nowhere deeper.
//!
//! User pointers never cross this layer raw: every buffer is validated
//! and copied through bounce buffers / the direct map, so subsystem
//! code below never touches user memory.

pub mod io;

use crate::arch;
use crate::error::{Errno, SysResult};
use crate::ipc::endpoint::{self, reply_to};
use crate::ipc::handle::{HandleKind, HandleObject, Rights};
use crate::ipc::message::Message;
use crate::ipc::{registry, shm, EndpointToken, Handle, ShmToken};
use crate::mm::{self, uaccess, VirtualAddress};
use crate::process;
use crate::sched::{self, TaskPtr};

/// Register snapshot produced by the syscall entry stub. Field order is
/// the stub's push order reversed; keep in sync with
/// `arch/x86_64/syscall.rs`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SyscallFrame {
    /// Syscall number in, return value out.
    pub rax: u64,
    /// arg0..arg5 (rdi, rsi, rdx, r10, r8, r9).
    pub args: [u64; 6],
    pub user_rip: u64,
    pub user_rflags: u64,
    pub user_rsp: u64,
}

/// Stable syscall numbering.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Nop = 0,
    GetCpuId = 1,
    SchedYield = 2,
    Read = 3,
    Write = 4,
    GetPid = 5,
    Exit = 6,
    IpcCreateEndpoint = 16,
    IpcSend = 17,
    IpcReceive = 18,
    IpcCall = 19,
    IpcReply = 20,
    IpcDestroyEndpoint = 21,
    IpcNotify = 22,
    ShmCreate = 23,
    ShmGrant = 24,
    ShmMap = 25,
    ShmUnmap = 26,
    ShmDestroy = 27,
    VfsGetBootstrapEndpoint = 28,
}

impl TryFrom<u64> for Syscall {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, ()> {
        match value {
            0 => Ok(Self::Nop),
            1 => Ok(Self::GetCpuId),
            2 => Ok(Self::SchedYield),
            3 => Ok(Self::Read),
            4 => Ok(Self::Write),
            5 => Ok(Self::GetPid),
            6 => Ok(Self::Exit),
            16 => Ok(Self::IpcCreateEndpoint),
            17 => Ok(Self::IpcSend),
            18 => Ok(Self::IpcReceive),
            19 => Ok(Self::IpcCall),
            20 => Ok(Self::IpcReply),
            21 => Ok(Self::IpcDestroyEndpoint),
            22 => Ok(Self::IpcNotify),
            23 => Ok(Self::ShmCreate),
            24 => Ok(Self::ShmGrant),
            25 => Ok(Self::ShmMap),
            26 => Ok(Self::ShmUnmap),
            27 => Ok(Self::ShmDestroy),
            28 => Ok(Self::VfsGetBootstrapEndpoint),
            _ => Err(()),
        }
    }
}

/// Bootstrap endpoint published by the VFS server at boot.
static BOOTSTRAP_ENDPOINT: spin::Once<EndpointToken> = spin::Once::new();

pub fn set_bootstrap_endpoint(token: EndpointToken) {
    BOOTSTRAP_ENDPOINT.call_once(|| token);
}

/// Entry from the architectural stub.
///
/// # Safety
///
/// `frame` must point at a live frame on the current kernel stack.
pub unsafe extern "C" fn dispatch_frame(frame: *mut SyscallFrame) {
    // SAFETY: the stub passes its own stack frame.
    let frame = unsafe { &mut *frame };
    frame.rax = dispatch(frame.rax, &frame.args);
}

/// Decode and run one syscall, encoding the result for the return
/// register.
pub fn dispatch(number: u64, args: &[u64; 6]) -> u64 {
    let syscall = match Syscall::try_from(number) {
        Ok(s) => s,
        Err(()) => return Errno::Nosys.as_ret(),
    };
    match handle(syscall, args) {
        Ok(value) => value,
        Err(errno) => errno.as_ret(),
    }
}

/// Execution context of the calling task.
struct Caller {
    task: TaskPtr,
    pid: crate::sched::Pid,
    process: alloc::sync::Arc<process::Process>,
}

fn caller() -> SysResult<Caller> {
    let task = sched::current().ok_or(Errno::Inval)?;
    // SAFETY: current task on this CPU.
    let pid = unsafe { task.get_mut().pid };
    let process = process::get(pid).ok_or(Errno::Inval)?;
    Ok(Caller { task, pid, process })
}

fn handle(syscall: Syscall, args: &[u64; 6]) -> SysResult<u64> {
    match syscall {
        Syscall::Nop => Ok(0),
        Syscall::GetCpuId => Ok(arch::cpu_id() as u64),
        Syscall::SchedYield => {
            sched::yield_now();
            Ok(0)
        }
        Syscall::GetPid => Ok(sched::current_pid()),
        Syscall::Exit => sys_exit(args[0]),
        Syscall::Read => io::sys_read(args[0], args[1], args[2] as usize),
        Syscall::Write => io::sys_write(args[0], args[1], args[2] as usize),
        Syscall::IpcCreateEndpoint => sys_ipc_create_endpoint(),
        Syscall::IpcSend => sys_ipc_send(args[0], args[1]),
        Syscall::IpcReceive => sys_ipc_receive(args[0], args[1]),
        Syscall::IpcCall => sys_ipc_call(args[0], args[1], args[2]),
        Syscall::IpcReply => sys_ipc_reply(args[0], args[1]),
        Syscall::IpcDestroyEndpoint => sys_ipc_destroy_endpoint(args[0]),
        Syscall::IpcNotify => sys_ipc_notify(args[0]),
        Syscall::ShmCreate => sys_shm_create(args[0] as usize),
        Syscall::ShmGrant => sys_shm_grant(args[0], args[1]),
        Syscall::ShmMap => sys_shm_map(args[0], args[1]),
        Syscall::ShmUnmap => sys_shm_unmap(args[0]),
        Syscall::ShmDestroy => sys_shm_destroy(args[0]),
        Syscall::VfsGetBootstrapEndpoint => sys_vfs_get_bootstrap_endpoint(),
    }
}

fn sys_exit(_code: u64) -> SysResult<u64> {
    let pid = sched::current_pid();
    if pid != 0 {
        process::remove(pid, mm::mapper());
    }
    sched::exit_current()
}

fn resolve_endpoint(
    ctx: &Caller,
    raw_handle: u64,
    need: Rights,
) -> SysResult<(EndpointToken, alloc::sync::Arc<crate::ipc::Endpoint>)> {
    let handle = Handle::from_u32(raw_handle as u32);
    let object = ctx
        .process
        .handles
        .lock()
        .lookup(handle, HandleKind::Endpoint, need)?;
    let HandleObject::Endpoint(token) = object else {
        return Err(Errno::Badf);
    };
    let ep = registry::acquire(token).ok_or(Errno::Nodev)?;
    Ok((token, ep))
}

fn sys_ipc_create_endpoint() -> SysResult<u64> {
    let ctx = caller()?;
    let (token, _ep) = registry::create(ctx.pid)?;
    let installed = ctx.process.handles.lock().install(
        HandleKind::Endpoint,
        Rights::ENDPOINT_DEFAULT,
        HandleObject::Endpoint(token),
    );
    match installed {
        Ok(handle) => Ok(handle.as_u32() as u64),
        Err(e) => {
            // No handle means no way to ever reach the endpoint; undo.
            let _ = registry::destroy(token, ctx.pid);
            Err(e.into())
        }
    }
}

fn sys_ipc_send(raw_handle: u64, msg_ptr: u64) -> SysResult<u64> {
    let ctx = caller()?;
    let (_token, ep) = resolve_endpoint(&ctx, raw_handle, Rights::SEND)?;
    let msg: Message = uaccess::copy_from_user_value(&ctx.process.space, msg_ptr)?;
    ep.send(ctx.task, msg)?;
    Ok(0)
}

fn sys_ipc_receive(raw_handle: u64, msg_out: u64) -> SysResult<u64> {
    let ctx = caller()?;
    // Validate the out-buffer up front: failing after the rendezvous
    // would lose a message.
    uaccess::validate_user_buffer(
        &ctx.process.space,
        msg_out,
        core::mem::size_of::<Message>(),
        true,
    )?;
    let (_token, ep) = resolve_endpoint(&ctx, raw_handle, Rights::RECEIVE)?;
    let (msg, caller_task) = ep.receive(ctx.task)?;

    let mut caller_handle = Handle::from_u32(0);
    if let Some(task) = caller_task {
        // SAFETY: the caller task is parked awaiting a reply; it cannot
        // die or be reaped while waiting_for_reply is set.
        unsafe {
            task.get_mut()
                .caller_refs
                .fetch_add(1, core::sync::atomic::Ordering::AcqRel);
        }
        match ctx.process.handles.lock().install(
            HandleKind::Caller,
            Rights::REPLY,
            HandleObject::Caller(task),
        ) {
            Ok(h) => caller_handle = h,
            Err(e) => {
                // No reply capability can exist: abort the caller so it
                // does not hang, and drop our reference.
                endpoint::abort_caller(task);
                sched::release_caller_ref(task);
                return Err(e.into());
            }
        }
    }

    if let Err(e) = uaccess::copy_to_user_value(&ctx.process.space, msg_out, &msg) {
        // The reply right must not leak: consume the handle and abort
        // the caller before failing.
        if caller_handle.as_u32() != 0 {
            if let Ok(HandleObject::Caller(task)) =
                ctx.process.handles.lock().free(caller_handle)
            {
                endpoint::abort_caller(task);
                sched::release_caller_ref(task);
            }
        }
        return Err(e);
    }
    Ok(caller_handle.as_u32() as u64)
}

fn sys_ipc_call(raw_handle: u64, req_ptr: u64, reply_out: u64) -> SysResult<u64> {
    let ctx = caller()?;
    uaccess::validate_user_buffer(
        &ctx.process.space,
        reply_out,
        core::mem::size_of::<Message>(),
        true,
    )?;
    let (_token, ep) = resolve_endpoint(&ctx, raw_handle, Rights::CALL)?;
    let req: Message = uaccess::copy_from_user_value(&ctx.process.space, req_ptr)?;
    let reply = ep.call(ctx.task, req)?;
    uaccess::copy_to_user_value(&ctx.process.space, reply_out, &reply)?;
    Ok(0)
}

fn sys_ipc_reply(raw_handle: u64, msg_ptr: u64) -> SysResult<u64> {
    let ctx = caller()?;
    let handle = Handle::from_u32(raw_handle as u32);
    // Validate before consuming anything so a bad message pointer
    // leaves the reply capability intact.
    ctx.process
        .handles
        .lock()
        .lookup(handle, HandleKind::Caller, Rights::REPLY)?;
    let msg: Message = uaccess::copy_from_user_value(&ctx.process.space, msg_ptr)?;
    // Caller handles are single-use: consume, then deliver.
    let object = ctx.process.handles.lock().free(handle)?;
    let HandleObject::Caller(task) = object else {
        return Err(Errno::Badf);
    };
    let result = reply_to(task, msg);
    sched::release_caller_ref(task);
    result?;
    Ok(0)
}

fn sys_ipc_destroy_endpoint(raw_handle: u64) -> SysResult<u64> {
    let ctx = caller()?;
    let handle = Handle::from_u32(raw_handle as u32);
    let object = ctx
        .process
        .handles
        .lock()
        .lookup(handle, HandleKind::Endpoint, Rights::empty())?;
    let HandleObject::Endpoint(token) = object else {
        return Err(Errno::Badf);
    };
    registry::destroy(token, ctx.pid)?;
    let _ = ctx.process.handles.lock().free(handle);
    Ok(0)
}

fn sys_ipc_notify(raw_handle: u64) -> SysResult<u64> {
    let ctx = caller()?;
    let (_token, ep) = resolve_endpoint(&ctx, raw_handle, Rights::SEND)?;
    ep.notify()?;
    Ok(0)
}

fn sys_shm_create(n_pages: usize) -> SysResult<u64> {
    let ctx = caller()?;
    let token = shm::create(ctx.pid, n_pages, mm::mapper())?;
    Ok(token.as_u64())
}

fn sys_shm_grant(raw_token: u64, grantee: u64) -> SysResult<u64> {
    let ctx = caller()?;
    shm::grant(ShmToken::from_u64(raw_token), ctx.pid, grantee)?;
    Ok(0)
}

fn sys_shm_map(raw_token: u64, va: u64) -> SysResult<u64> {
    let ctx = caller()?;
    let va = VirtualAddress::new(va);
    if !va.is_page_aligned() || !va.is_user() {
        return Err(Errno::Inval);
    }
    shm::map(ShmToken::from_u64(raw_token), ctx.pid, &ctx.process.space, va)?;
    Ok(0)
}

fn sys_shm_unmap(raw_token: u64) -> SysResult<u64> {
    let ctx = caller()?;
    shm::unmap(ShmToken::from_u64(raw_token), ctx.pid, &ctx.process.space)?;
    Ok(0)
}

fn sys_shm_destroy(raw_token: u64) -> SysResult<u64> {
    let ctx = caller()?;
    shm::destroy(ShmToken::from_u64(raw_token), ctx.pid, mm::mapper())?;
    Ok(0)
}

fn sys_vfs_get_bootstrap_endpoint() -> SysResult<u64> {
    let ctx = caller()?;
    let token = *BOOTSTRAP_ENDPOINT.get().ok_or(Errno::Nodev)?;
    // The bootstrap channel is for talking to the VFS, not owning it.
    let handle = ctx.process.handles.lock().install(
        HandleKind::Endpoint,
        Rights::SEND | Rights::CALL,
        HandleObject::Endpoint(token),
    )?;
    Ok(handle.as_u32() as u64)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn unknown_syscalls_report_nosys() {
        assert_eq!(dispatch(999, &[0; 6]) as i64, -38);
        assert_eq!(dispatch(7, &[0; 6]) as i64, -38);
        assert_eq!(dispatch(15, &[0; 6]) as i64, -38);
    }

    #[test]
    fn numbering_is_stable() {
        assert_eq!(Syscall::try_from(0), Ok(Syscall::Nop));
        assert_eq!(Syscall::try_from(3), Ok(Syscall::Read));
        assert_eq!(Syscall::try_from(4), Ok(Syscall::Write));
        assert_eq!(Syscall::try_from(16), Ok(Syscall::IpcCreateEndpoint));
        assert_eq!(Syscall::try_from(20), Ok(Syscall::IpcReply));
        assert_eq!(Syscall::try_from(27), Ok(Syscall::ShmDestroy));
        assert_eq!(Syscall::try_from(28), Ok(Syscall::VfsGetBootstrapEndpoint));
    }

    #[test]
    fn nop_and_cpu_id_work_without_task_context() {
        assert_eq!(dispatch(0, &[0; 6]), 0);
        assert_eq!(dispatch(1, &[0; 6]), 0); // host cpu id
    }

    #[test]
    fn task_requiring_syscalls_fail_cleanly_without_context() {
        crate::sched::scheduler::tests::ensure_test_init();
        // No current task on the host: capability syscalls must not
        // panic, they return EINVAL.
        assert_eq!(dispatch(16, &[0; 6]) as i64, -22);
        assert_eq!(dispatch(17, &[1, 0, 0, 0, 0, 0]) as i64, -22);
    }

    #[test]
    fn frame_layout_matches_entry_stub() {
        assert_eq!(core::mem::size_of::<SyscallFrame>(), 80);
        assert_eq!(core::mem::offset_of!(SyscallFrame, rax), 0);
        assert_eq!(core::mem::offset_of!(SyscallFrame, args), 8);
        assert_eq!(core::mem::offset_of!(SyscallFrame, user_rip), 56);
        assert_eq!(core::mem::offset_of!(SyscallFrame, user_rflags), 64);
        assert_eq!(core::mem::offset_of!(SyscallFrame, user_rsp), 72);
    }
}
