//! The address→size map fed by the `malloc` interceptor.
//!
//! The interceptor is live from the very first allocation the process
//! makes, before this crate's own heap-backed containers can exist. The
//! registry therefore has two phases: a fixed, const-initializable
//! bootstrap buffer that absorbs early allocations, and a heap map that
//! takes over once [`promote`](AllocationRegistry::promote) runs during
//! the startup hook. The one-shot "live" flag only ever moves false→true.
//!
//! `free` is deliberately not intercepted; stale entries linger until a
//! later allocation reuses the same base address and overwrites them.

use std::collections::HashMap;
use std::sync::Mutex;

/// Capacity of the pre-promotion buffer. Sized for the dynamic-linker and
/// libc warm-up allocations that happen before the startup hook runs.
pub const BOOTSTRAP_CAP: usize = 8192;

struct Bootstrap {
    entries: [(usize, usize); BOOTSTRAP_CAP],
    len: usize,
    live: bool,
}

impl Bootstrap {
    /// Index of `addr` in the filled prefix, if present.
    fn position(&self, addr: usize) -> Option<usize> {
        self.entries[..self.len].iter().position(|e| e.0 == addr)
    }
}

/// Thread-safe map from allocation base address to allocation size.
pub struct AllocationRegistry {
    /// Pre-promotion storage plus the live flag; trivially initializable,
    /// taken first on every register call to decide which phase applies.
    bootstrap: Mutex<Bootstrap>,

    /// Post-promotion storage. `None` until promotion.
    main: Mutex<Option<HashMap<usize, usize>>>,
}

impl AllocationRegistry {
    pub const fn new() -> AllocationRegistry {
        AllocationRegistry {
            bootstrap: Mutex::new(Bootstrap {
                entries: [(0, 0); BOOTSTRAP_CAP],
                len: 0,
                live: false,
            }),
            main: Mutex::new(None),
        }
    }

    /// Record an allocation. Re-registering a base address overwrites the
    /// previous size. Pre-promotion inserts that would overflow the
    /// bootstrap buffer are dropped.
    pub fn register(&self, addr: usize, size: usize) {
        {
            let mut boot = match self.bootstrap.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !boot.live {
                match boot.position(addr) {
                    Some(i) => boot.entries[i] = (addr, size),
                    None if boot.len < BOOTSTRAP_CAP => {
                        let i = boot.len;
                        boot.entries[i] = (addr, size);
                        boot.len += 1;
                    }
                    None => {} // full; dropped
                }
                return;
            }
        }

        // Live phase. The bootstrap lock is released before this one; no
        // thread ever holds two registry locks at once.
        let mut main = match self.main.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(map) = main.as_mut() {
            map.insert(addr, size);
        }
    }

    /// The size registered for `addr`, if any. Always unknown before
    /// promotion.
    pub fn lookup(&self, addr: usize) -> Option<usize> {
        if !self.is_live() {
            return None;
        }
        let main = match self.main.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        main.as_ref().and_then(|map| map.get(&addr).copied())
    }

    /// Whether promotion has happened.
    pub fn is_live(&self) -> bool {
        match self.bootstrap.lock() {
            Ok(guard) => guard.live,
            Err(poisoned) => poisoned.into_inner().live,
        }
    }

    /// Drain the bootstrap buffer into the heap map and flip the live
    /// flag. Idempotent; only the first call does anything.
    pub fn promote(&self) {
        let drained: Vec<(usize, usize)> = {
            let mut boot = match self.bootstrap.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if boot.live {
                return;
            }
            boot.live = true;
            boot.entries[..boot.len].to_vec()
        };

        let mut main = match self.main.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let map = main.get_or_insert_with(HashMap::new);
        for (addr, size) in drained {
            map.insert(addr, size);
        }
        log::debug!("allocation registry live with {} early entries", map.len());
    }

    /// Number of addresses currently known. Post-promotion only.
    pub fn len(&self) -> usize {
        let main = match self.main.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        main.as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AllocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_are_unknown_before_promotion() {
        static REG: AllocationRegistry = AllocationRegistry::new();
        REG.register(0x1000, 64);
        assert_eq!(REG.lookup(0x1000), None);
    }

    #[test]
    fn promotion_drains_the_bootstrap_buffer() {
        static REG: AllocationRegistry = AllocationRegistry::new();
        REG.register(0x1000, 64);
        REG.register(0x2000, 128);
        REG.promote();
        assert_eq!(REG.lookup(0x1000), Some(64));
        assert_eq!(REG.lookup(0x2000), Some(128));
        assert_eq!(REG.lookup(0x3000), None);
        assert_eq!(REG.len(), 2);
    }

    #[test]
    fn duplicate_bases_overwrite_in_both_phases() {
        static REG: AllocationRegistry = AllocationRegistry::new();
        REG.register(0x1000, 100);
        REG.register(0x1000, 200);
        REG.promote();
        assert_eq!(REG.lookup(0x1000), Some(200));
        assert_eq!(REG.len(), 1);

        REG.register(0x1000, 300);
        assert_eq!(REG.lookup(0x1000), Some(300));
        assert_eq!(REG.len(), 1);
    }

    #[test]
    fn bootstrap_overflow_is_dropped_silently() {
        static REG: AllocationRegistry = AllocationRegistry::new();
        for i in 0..BOOTSTRAP_CAP + 100 {
            REG.register(0x10_0000 + i * 16, 16);
        }
        REG.promote();
        assert_eq!(REG.len(), BOOTSTRAP_CAP);
        assert_eq!(REG.lookup(0x10_0000), Some(16));
        // the post-capacity registrations went nowhere
        assert_eq!(REG.lookup(0x10_0000 + (BOOTSTRAP_CAP + 1) * 16), None);
    }

    #[test]
    fn promotion_is_one_shot() {
        static REG: AllocationRegistry = AllocationRegistry::new();
        REG.register(0x1000, 1);
        REG.promote();
        REG.register(0x2000, 2);
        REG.promote(); // second promotion must not clobber live entries
        assert_eq!(REG.lookup(0x2000), Some(2));
    }

    #[test]
    fn registrations_after_promotion_land_in_the_map() {
        static REG: AllocationRegistry = AllocationRegistry::new();
        REG.promote();
        REG.register(0xabc0, 4096);
        assert_eq!(REG.lookup(0xabc0), Some(4096));
    }
}
