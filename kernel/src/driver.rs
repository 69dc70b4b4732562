//! Driver registry
//!
//! Named, typed, prioritized driver records behind a uniform lifecycle.
//! `init_all` brings everything up in priority order while honoring
//! declared dependencies; a driver whose dependency never resolves is
//! marked failed rather than blocking the rest of the kernel.
//!
//! Driver init functions must not call back into the registry.

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Capacity of the registry.
pub const MAX_DRIVERS: usize = 64;

/// Longest accepted driver name.
pub const MAX_NAME_LEN: usize = 31;

/// Driver category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Fundamental,
    Block,
    Char,
    Net,
    Input,
    Timer,
    Fs,
    Video,
    Audio,
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Uninitialized,
    Initialized,
    Enabled,
    Disabled,
    Failed,
}

pub type DriverInit = fn() -> KernelResult<()>;
pub type DriverCleanup = fn();

/// A registered driver record.
#[derive(Clone, Copy)]
pub struct Driver {
    pub name: &'static str,
    pub kind: DriverKind,
    pub version: &'static str,
    /// Bring-up priority; lower initializes first.
    pub priority: u8,
    /// Name of a driver that must be initialized before this one.
    pub depends_on: Option<&'static str>,
    pub init: DriverInit,
    pub cleanup: Option<DriverCleanup>,
    /// Opaque per-driver word, interpreted only by the driver itself.
    pub driver_data: usize,
}

#[derive(Clone, Copy)]
struct Entry {
    driver: Driver,
    status: DriverStatus,
}

/// Fixed-capacity driver registry.
pub struct DriverRegistry {
    entries: [Option<Entry>; MAX_DRIVERS],
}

impl DriverRegistry {
    pub const fn new() -> Self {
        Self {
            entries: [None; MAX_DRIVERS],
        }
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.driver.name == name))
    }

    /// Fetch a copy of a registered driver record.
    pub fn get_by_name(&self, name: &str) -> KernelResult<Driver> {
        self.find(name)
            .map(|i| self.entries[i].as_ref().expect("slot occupied").driver)
            .ok_or(KernelError::NotFound { what: "driver" })
    }

    /// Register a driver. Names are unique and non-empty.
    pub fn register(&mut self, driver: Driver) -> KernelResult<()> {
        if driver.name.is_empty() || driver.name.len() > MAX_NAME_LEN {
            return Err(KernelError::InvalidArgument {
                what: "driver name",
            });
        }
        if self.find(driver.name).is_some() {
            return Err(KernelError::AlreadyExists { what: "driver" });
        }
        let slot = self
            .entries
            .iter()
            .position(|e| e.is_none())
            .ok_or(KernelError::InvalidArgument {
                what: "driver registry full",
            })?;
        self.entries[slot] = Some(Entry {
            driver,
            status: DriverStatus::Uninitialized,
        });
        Ok(())
    }

    /// Remove a driver, running its cleanup hook if it was brought up.
    pub fn unregister(&mut self, name: &str) -> KernelResult<()> {
        let idx = self.find(name).ok_or(KernelError::NotFound { what: "driver" })?;
        let entry = self.entries[idx].take().expect("slot checked occupied");
        if matches!(
            entry.status,
            DriverStatus::Initialized | DriverStatus::Enabled
        ) {
            if let Some(cleanup) = entry.driver.cleanup {
                cleanup();
            }
        }
        Ok(())
    }

    pub fn status(&self, name: &str) -> KernelResult<DriverStatus> {
        self.find(name)
            .map(|i| self.entries[i].as_ref().expect("slot occupied").status)
            .ok_or(KernelError::NotFound { what: "driver" })
    }

    /// Collect the names of drivers of `kind` into `out`. Returns how many
    /// were written.
    pub fn get_by_kind(&self, kind: DriverKind, out: &mut [&'static str]) -> usize {
        let mut n = 0;
        for entry in self.entries.iter().flatten() {
            if entry.driver.kind == kind {
                if n == out.len() {
                    break;
                }
                out[n] = entry.driver.name;
                n += 1;
            }
        }
        n
    }

    pub fn count(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    fn dependency_ready(&self, dep: Option<&str>) -> bool {
        match dep {
            None | Some("") => true,
            Some(name) => self.find(name).is_some_and(|i| {
                matches!(
                    self.entries[i].as_ref().expect("slot occupied").status,
                    DriverStatus::Initialized | DriverStatus::Enabled
                )
            }),
        }
    }

    /// Bring up every registered driver: at most `2 * count` rounds, each
    /// sweeping priorities 0..=255 and initializing every driver whose
    /// dependency is satisfied. Stops early when a round makes no
    /// progress; whatever is still uninitialized then has an unresolvable
    /// dependency and is marked failed.
    ///
    /// Returns the number of drivers that initialized successfully.
    pub fn init_all(&mut self) -> usize {
        let rounds = 2 * self.count();
        let mut initialized = 0;

        for _ in 0..rounds {
            let mut progress = false;
            for priority in 0..=u8::MAX {
                for idx in 0..MAX_DRIVERS {
                    let Some(entry) = self.entries[idx] else {
                        continue;
                    };
                    if entry.status != DriverStatus::Uninitialized
                        || entry.driver.priority != priority
                        || !self.dependency_ready(entry.driver.depends_on)
                    {
                        continue;
                    }

                    let status = match (entry.driver.init)() {
                        Ok(()) => {
                            log::info!(
                                "driver: {} v{} initialized (priority {})",
                                entry.driver.name,
                                entry.driver.version,
                                priority
                            );
                            initialized += 1;
                            progress = true;
                            DriverStatus::Initialized
                        }
                        Err(e) => {
                            log::error!("driver: {} failed to initialize: {}", entry.driver.name, e);
                            progress = true;
                            DriverStatus::Failed
                        }
                    };
                    self.entries[idx].as_mut().expect("slot occupied").status = status;
                }
            }
            if !progress {
                break;
            }
        }

        for idx in 0..MAX_DRIVERS {
            let Some(entry) = self.entries[idx] else {
                continue;
            };
            if entry.status == DriverStatus::Uninitialized {
                log::error!(
                    "driver: {} failed: dependency '{}' never initialized",
                    entry.driver.name,
                    entry.driver.depends_on.unwrap_or("?")
                );
                self.entries[idx].as_mut().expect("slot occupied").status = DriverStatus::Failed;
            }
        }

        initialized
    }

    /// Log one line per registered driver.
    pub fn list(&self) {
        for entry in self.entries.iter().flatten() {
            log::info!(
                "driver: {:<16} {:?} v{} priority={} status={:?}",
                entry.driver.name,
                entry.driver.kind,
                entry.driver.version,
                entry.driver.priority,
                entry.status
            );
        }
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global driver registry
pub static REGISTRY: Mutex<DriverRegistry> = Mutex::new(DriverRegistry::new());

/// Reset the global registry. Called once during bring-up.
pub fn registry_init() {
    *REGISTRY.lock() = DriverRegistry::new();
    log::info!("driver: registry ready ({} slots)", MAX_DRIVERS);
}

pub fn register(driver: Driver) -> KernelResult<()> {
    REGISTRY.lock().register(driver)
}

pub fn get_by_name(name: &str) -> KernelResult<Driver> {
    REGISTRY.lock().get_by_name(name)
}

pub fn unregister(name: &str) -> KernelResult<()> {
    REGISTRY.lock().unregister(name)
}

pub fn status(name: &str) -> KernelResult<DriverStatus> {
    REGISTRY.lock().status(name)
}

pub fn init_all() -> usize {
    REGISTRY.lock().init_all()
}

pub fn list() {
    REGISTRY.lock().list()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::vec;
    use std::vec::Vec;

    fn ok_init() -> KernelResult<()> {
        Ok(())
    }

    fn driver(name: &'static str, priority: u8, depends_on: Option<&'static str>) -> Driver {
        Driver {
            name,
            kind: DriverKind::Char,
            version: "1.0",
            priority,
            depends_on,
            init: ok_init,
            cleanup: None,
            driver_data: 0,
        }
    }

    #[test]
    fn duplicate_and_invalid_names_are_rejected() {
        let mut reg = DriverRegistry::new();
        reg.register(driver("uart", 0, None)).unwrap();
        assert!(matches!(
            reg.register(driver("uart", 1, None)),
            Err(KernelError::AlreadyExists { .. })
        ));
        assert!(matches!(
            reg.register(driver("", 0, None)),
            Err(KernelError::InvalidArgument { .. })
        ));
        assert!(matches!(
            reg.register(driver("this-driver-name-is-way-too-long-to-fit", 0, None)),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn registry_capacity_is_enforced() {
        use std::boxed::Box;
        use std::format;

        let mut reg = DriverRegistry::new();
        // Fill the registry via leaked names.
        for i in 0..MAX_DRIVERS {
            let name: &'static str = Box::leak(format!("drv{}", i).into_boxed_str());
            reg.register(driver(name, 0, None)).unwrap();
        }
        assert!(matches!(
            reg.register(driver("overflow", 0, None)),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn init_all_runs_in_priority_order() {
        static TRACE: StdMutex<Vec<&'static str>> = StdMutex::new(Vec::new());

        fn record(name: &'static str) -> KernelResult<()> {
            TRACE.lock().unwrap().push(name);
            Ok(())
        }
        fn init_late() -> KernelResult<()> {
            record("late")
        }
        fn init_early() -> KernelResult<()> {
            record("early")
        }
        fn init_mid() -> KernelResult<()> {
            record("mid")
        }

        let mut reg = DriverRegistry::new();
        let mut late = driver("late", 200, None);
        late.init = init_late;
        let mut early = driver("early", 5, None);
        early.init = init_early;
        let mut mid = driver("mid", 100, None);
        mid.init = init_mid;
        reg.register(late).unwrap();
        reg.register(early).unwrap();
        reg.register(mid).unwrap();

        assert_eq!(reg.init_all(), 3);
        assert_eq!(*TRACE.lock().unwrap(), vec!["early", "mid", "late"]);
    }

    #[test]
    fn dependency_on_higher_priority_driver_still_resolves() {
        static TRACE: StdMutex<Vec<&'static str>> = StdMutex::new(Vec::new());

        fn init_consumer() -> KernelResult<()> {
            TRACE.lock().unwrap().push("consumer");
            Ok(())
        }
        fn init_provider() -> KernelResult<()> {
            TRACE.lock().unwrap().push("provider");
            Ok(())
        }

        let mut reg = DriverRegistry::new();
        // The consumer has the LOWER priority number, so the first sweep
        // reaches it before its dependency; the outer loop's next round
        // picks it up.
        let mut consumer = driver("consumer", 10, Some("provider"));
        consumer.init = init_consumer;
        let mut provider = driver("provider", 50, None);
        provider.init = init_provider;
        reg.register(consumer).unwrap();
        reg.register(provider).unwrap();

        assert_eq!(reg.init_all(), 2);
        assert_eq!(*TRACE.lock().unwrap(), vec!["provider", "consumer"]);
        assert_eq!(reg.status("consumer").unwrap(), DriverStatus::Initialized);
    }

    #[test]
    fn unmet_dependency_marks_driver_failed_without_invoking_init() {
        use core::sync::atomic::{AtomicBool, Ordering};
        static INVOKED: AtomicBool = AtomicBool::new(false);

        fn init_orphan() -> KernelResult<()> {
            INVOKED.store(true, Ordering::Relaxed);
            Ok(())
        }

        let mut reg = DriverRegistry::new();
        let mut orphan = driver("orphan", 10, Some("missing"));
        orphan.init = init_orphan;
        reg.register(orphan).unwrap();

        assert_eq!(reg.init_all(), 0);
        assert!(!INVOKED.load(Ordering::Relaxed));
        assert_eq!(reg.status("orphan").unwrap(), DriverStatus::Failed);
    }

    #[test]
    fn failing_init_is_terminal_for_that_driver_only() {
        fn init_broken() -> KernelResult<()> {
            Err(KernelError::Hardware {
                device: "broken",
                code: 1,
            })
        }

        let mut reg = DriverRegistry::new();
        let mut broken = driver("broken", 1, None);
        broken.init = init_broken;
        reg.register(broken).unwrap();
        reg.register(driver("fine", 2, None)).unwrap();

        assert_eq!(reg.init_all(), 1);
        assert_eq!(reg.status("broken").unwrap(), DriverStatus::Failed);
        assert_eq!(reg.status("fine").unwrap(), DriverStatus::Initialized);
    }

    #[test]
    fn get_by_kind_filters_and_counts() {
        let mut reg = DriverRegistry::new();
        let mut blk = driver("disk0", 1, None);
        blk.kind = DriverKind::Block;
        reg.register(blk).unwrap();
        reg.register(driver("serial0", 1, None)).unwrap();

        let mut names = [""; 4];
        assert_eq!(reg.get_by_kind(DriverKind::Block, &mut names), 1);
        assert_eq!(names[0], "disk0");
        assert_eq!(reg.get_by_kind(DriverKind::Net, &mut names), 0);
    }
}
