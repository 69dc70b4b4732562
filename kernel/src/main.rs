//! EmberOS kernel binary
//!
//! Bring-up in dependency order: serial console and logging, interrupt
//! plumbing, the memory stack (direct map, PMM, VMM, buddy+slab heap),
//! the driver registry, and finally the scheduler. The boot thread of
//! control becomes the idle task; once interrupts are enabled the timer
//! drives preemption.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use bootloader_api::config::Mapping;
    use bootloader_api::{entry_point, BootInfo, BootloaderConfig};
    use ember_kernel::{arch, block, driver, drivers, fs, logger, mm, sched, tty};
    use ember_kernel::driver::{Driver, DriverKind};
    use ember_kernel::error::KernelResult;
    use ember_kernel::println;

    static BOOT_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOT_CONFIG);

    /// Largest boot memory map we accept.
    const MAX_REGIONS: usize = 64;

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        println!("EmberOS v{}", env!("CARGO_PKG_VERSION"));
        logger::init(log::LevelFilter::Info);

        arch::x86_64::init();

        let phys_offset = boot_info
            .physical_memory_offset
            .into_option()
            .expect("bootloader did not map physical memory");
        mm::init(phys_offset);

        let mut regions = [mm::MemoryRegion {
            start: 0,
            size: 0,
            usable: false,
        }; MAX_REGIONS];
        let mut count = 0;
        for region in boot_info.memory_regions.iter() {
            if count == MAX_REGIONS {
                break;
            }
            regions[count] = mm::MemoryRegion {
                start: region.start,
                size: region.end - region.start,
                usable: region.kind == bootloader_api::info::MemoryRegionKind::Usable,
            };
            count += 1;
        }
        mm::pmm::init(&regions[..count]);
        mm::vmm::init();
        mm::heap::init().expect("heap bring-up failed");

        sched::task_init();
        sched::scheduler_init().expect("scheduler bring-up failed");

        driver::registry_init();
        register_drivers();
        let brought_up = driver::init_all();
        log::info!("drivers: {} initialized", brought_up);
        driver::list();

        sched::spawn("console", console_task).expect("console task");

        x86_64::instructions::interrupts::enable();
        log::info!("ember: up, entering idle");

        // The boot context is the idle task from here on.
        arch::halt_loop();
    }

    fn register_drivers() {
        let table = [
            Driver {
                name: "pit",
                kind: DriverKind::Timer,
                version: "1.0",
                priority: 10,
                depends_on: None,
                init: pit_init,
                cleanup: None,
                driver_data: 0,
            },
            Driver {
                name: "keyboard",
                kind: DriverKind::Input,
                version: "1.0",
                priority: 20,
                depends_on: None,
                init: drivers::keyboard::init,
                cleanup: None,
                driver_data: 0,
            },
            Driver {
                name: "tty",
                kind: DriverKind::Char,
                version: "1.0",
                priority: 30,
                depends_on: Some("keyboard"),
                init: tty::init,
                cleanup: None,
                driver_data: 0,
            },
            Driver {
                name: "ramdisk",
                kind: DriverKind::Block,
                version: "1.0",
                priority: 40,
                depends_on: None,
                init: drivers::ramdisk::init,
                cleanup: None,
                driver_data: 0,
            },
            Driver {
                name: "ata",
                kind: DriverKind::Block,
                version: "1.0",
                priority: 41,
                depends_on: None,
                init: drivers::ata::init,
                cleanup: None,
                driver_data: 0,
            },
            Driver {
                name: "nvme",
                kind: DriverKind::Block,
                version: "1.0",
                priority: 42,
                depends_on: None,
                init: drivers::nvme::init,
                cleanup: None,
                driver_data: 0,
            },
            Driver {
                name: "ramfs",
                kind: DriverKind::Fs,
                version: "1.0",
                priority: 60,
                depends_on: None,
                init: fs::ramfs::init,
                cleanup: None,
                driver_data: 0,
            },
        ];
        for d in table {
            driver::register(d).expect("driver registration");
        }
    }

    fn pit_init() -> KernelResult<()> {
        arch::x86_64::pit::init();
        Ok(())
    }

    /// Echo console: blocks on the TTY, proving the block/unblock path.
    extern "C" fn console_task() {
        let mut line = [0u8; 256];
        println!("type a line; blocks until enter ({} block devices up)", block::device_count());
        loop {
            match tty::read_line(&mut line) {
                Ok(n) => {
                    if let Ok(text) = core::str::from_utf8(&line[..n]) {
                        println!("tty: {}", text);
                    }
                }
                Err(e) => {
                    log::error!("console: {}", e);
                    sched::task_yield();
                }
            }
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        println!("[KERNEL PANIC] {}", info);
        arch::halt_loop();
    }
}

// The kernel only runs bare-metal; the host build of this binary exists so
// `cargo test` can link the workspace.
#[cfg(not(target_os = "none"))]
fn main() {}
