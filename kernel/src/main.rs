//! Kernel binary: boot entry, memory bring-up, scheduler start.
#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use core::panic::PanicInfo;

    use zincos_kernel::boot_info::BootInfo;
    use zincos_kernel::config::{HEAP_BASE, HEAP_INITIAL_PAGES, HEAP_MAX_SIZE, MAX_CPUS};
    use zincos_kernel::mm::heap::{GrowHook, MapperGrowHook};
    use zincos_kernel::mm::page_table::X86PageMapper;
    use zincos_kernel::mm::{self, frame_allocator, MappingRoot};
    use zincos_kernel::arch::{self, x86_64 as arch_x86};
    use zincos_kernel::{ipc, logger, println, sched, serial, syscall};

    /// Fallback APIC timer calibration (counts per millisecond at
    /// divide-by-16). The platform bring-up layer measures the real
    /// value against the PIT and reconfigures before user tasks run.
    const FALLBACK_TIMER_COUNTS_PER_MS: u32 = 62_500;

    static MAPPER_CELL: spin::Once<X86PageMapper> = spin::Once::new();
    static GROW_HOOK_CELL: spin::Once<MapperGrowHook> = spin::Once::new();

    /// BSP entry, called by the UEFI loader with the boot handshake.
    #[no_mangle]
    pub extern "C" fn _start(boot_info: *const BootInfo) -> ! {
        serial::init();
        logger::init(None);
        println!("ZincOS v{}", env!("CARGO_PKG_VERSION"));

        // SAFETY: the loader passes a pointer to a BootInfo it keeps
        // mapped; validate() checks the magic before anything else.
        let boot = unsafe { &*boot_info };
        boot.validate().expect("bad boot handshake");

        arch_x86::init_bsp();
        frame_allocator::init(boot);

        // The loader left its page tables active; adopt them as the
        // kernel root.
        let kernel_root = {
            use x86_64::registers::control::Cr3;
            MappingRoot(Cr3::read().0.start_address().as_u64())
        };
        let mapper = MAPPER_CELL.call_once(|| {
            X86PageMapper::new(boot.hhdm_base, kernel_root, frame_allocator::pmm())
        });
        mm::install_mapper(mapper);

        // Heap: map the initial window, then hand the rest to demand
        // growth.
        let hook = GROW_HOOK_CELL.call_once(|| MapperGrowHook::new(mapper));
        let initial = HEAP_INITIAL_PAGES * zincos_kernel::config::FRAME_SIZE;
        assert!(
            hook.grow(HEAP_BASE, HEAP_BASE + initial as u64),
            "cannot map initial heap"
        );
        // SAFETY: the range was just mapped and belongs solely to the
        // heap.
        unsafe {
            zincos_kernel::kernel_heap().init(
                HEAP_BASE,
                initial,
                HEAP_MAX_SIZE,
                Some(hook as &dyn GrowHook),
            );
        }
        log::info!("heap: {} KiB initial at {:#x}", initial / 1024, HEAP_BASE);

        arch_x86::apic::PLATFORM.configure(
            boot.cpu_count.min(MAX_CPUS as u32),
            FALLBACK_TIMER_COUNTS_PER_MS,
            &[boot.bsp_apic_id],
        );
        sched::init(&arch_x86::apic::PLATFORM, mapper);
        sched::start_on_bsp();

        // Kernel-owned bootstrap endpoint: the VFS server receives on
        // it, everyone else gets send/call handles on request.
        let (bootstrap, _ep) = ipc::registry::create(0).expect("bootstrap endpoint");
        syscall::set_bootstrap_endpoint(bootstrap);

        log::info!(
            "boot complete: {} CPUs reported, pmm {:?}",
            boot.cpu_count,
            frame_allocator::pmm().stats()
        );

        // The boot flow continues as the BSP's housekeeping task; user
        // bootstrap (initrd, VFS, shell) is platform code layered on
        // top of the core. Drop into the idle band first, so spawned
        // work outranks this loop from now on.
        sched::set_current_priority(zincos_kernel::sched::task::band::IDLE_MIN);
        loop {
            sched::reap_dead();
            sched::yield_now();
            arch::wait_for_interrupt();
        }
    }

    /// AP entry, called by the SMP trampoline after switching to long
    /// mode on the kernel page tables.
    #[no_mangle]
    pub extern "C" fn kernel_ap_main(cpu: u32) -> ! {
        arch_x86::init_ap(cpu);
        sched::start_on_ap()
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("[KERNEL PANIC] {}", info);
        zincos_kernel::exit_qemu(zincos_kernel::QemuExitCode::Failed);
        arch::halt_loop()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel only runs on bare metal; the host build exists so
    // `cargo test` can link the workspace.
}
