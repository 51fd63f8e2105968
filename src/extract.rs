//! Workload metrics from an opaque region payload.
//!
//! The host runtime packs a parallel region's captured variables into a
//! struct on the calling thread's stack and passes its address as the
//! region payload. We cannot know that struct's layout, but any heap
//! buffer the region works on appears in it as a plain pointer, so a
//! word-by-word sweep of the stack above the payload, checked against the
//! allocation registry, recovers the region's buffers and their sizes.
//!
//! This is a heuristic. An integer that happens to equal an allocation
//! base is a false positive; a pointer stored with an offset is a false
//! negative. The output feeds a regression model, not a correctness
//! decision, so both are acceptable.

use std::ops::Range;

use crate::registry::AllocationRegistry;

/// Length of the feature vector: slot 0 is the thread count, slots 1..=9
/// hold the sizes of discovered allocations.
pub const NR_METRICS: usize = 10;

const WORD: usize = std::mem::size_of::<usize>();

/// Per-region assignment of embedded addresses to feature slots.
///
/// A model's coefficients are only meaningful if the same buffer lands at
/// the same position on every call, so slots are handed out in first-seen
/// order and never reclaimed or renumbered.
#[derive(Default)]
pub struct SlotMap {
    slots: std::collections::HashMap<usize, usize>,
}

impl SlotMap {
    pub fn new() -> SlotMap {
        SlotMap::default()
    }

    /// The feature slot for `addr`, assigning the next free one if this
    /// address is new and capacity remains. `None` once all nine slots are
    /// taken by other addresses.
    fn resolve(&mut self, addr: usize) -> Option<usize> {
        if let Some(&slot) = self.slots.get(&addr) {
            return Some(slot);
        }
        if self.slots.len() < NR_METRICS - 1 {
            let slot = self.slots.len() + 1;
            self.slots.insert(addr, slot);
            return Some(slot);
        }
        None
    }
}

/// The calling thread's stack bounds, from the `[stack]` line of
/// `/proc/self/maps`. `None` if the map is unreadable or has no stack
/// entry (worker threads' stacks are anonymous mappings and do not count).
pub fn stack_bounds() -> Option<Range<usize>> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    find_stack_bounds(&maps)
}

fn find_stack_bounds(maps: &str) -> Option<Range<usize>> {
    let line = maps.lines().find(|l| l.contains("[stack]"))?;
    let range = line.split_whitespace().next()?;
    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    Some(start..end)
}

/// Build the feature vector for one region call.
///
/// Sweeps from `payload` up to the end of `bounds`, recording the
/// registry-reported size of every embedded allocation address at that
/// address's permanent slot. A payload outside the bounds (or absent
/// bounds) yields a vector that is zero except for the thread count.
pub fn extract(
    payload: usize,
    bounds: Option<Range<usize>>,
    registry: &AllocationRegistry,
    slots: &mut SlotMap,
    thread_count: u32,
) -> [f64; NR_METRICS] {
    let mut features = [0.0; NR_METRICS];
    features[0] = thread_count as f64;

    let bounds = match bounds {
        Some(b) => b,
        None => return features,
    };
    if payload == 0 || !bounds.contains(&payload) {
        log::warn!("region payload {:#x} is not on the calling stack", payload);
        return features;
    }

    // Word-align upward; the sweep reads whole words only.
    let start = (payload + WORD - 1) & !(WORD - 1);
    let words = bounds.end.saturating_sub(start) / WORD;

    let mut found = 0;
    for i in 0..words {
        let word = unsafe { ((start + i * WORD) as *const usize).read_volatile() };
        if let Some(size) = registry.lookup(word) {
            if let Some(slot) = slots.resolve(word) {
                features[slot] = size as f64;
            }
            found += 1;
            if found == NR_METRICS - 1 {
                break;
            }
        }
    }

    features
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds_of(words: &[usize]) -> Range<usize> {
        let start = words.as_ptr() as usize;
        start..start + std::mem::size_of_val(words)
    }

    #[test]
    fn stack_line_parses_from_maps_format() {
        let maps = "7ffe8000-7fff0000 r--p 00000000 08:01 123 /usr/lib/libc.so\n\
                    7ffd1000-7ffd8000 rw-p 00000000 00:00 0   [stack]\n";
        assert_eq!(find_stack_bounds(maps), Some(0x7ffd1000..0x7ffd8000));
        assert_eq!(find_stack_bounds("no stack here\n"), None);
    }

    #[test]
    fn registered_buffers_surface_as_sizes() {
        static REG: AllocationRegistry = AllocationRegistry::new();
        REG.register(0xa000, 4000);
        REG.promote();

        let frame = [0xa000_usize, 0xdead, 17];
        let mut slots = SlotMap::new();
        let features = extract(
            frame.as_ptr() as usize,
            Some(bounds_of(&frame)),
            &REG,
            &mut slots,
            4,
        );

        assert_eq!(features[0], 4.0);
        assert_eq!(features[1], 4000.0);
        assert_eq!(&features[2..], &[0.0; 8]);
    }

    #[test]
    fn payload_off_stack_yields_thread_count_only() {
        static REG: AllocationRegistry = AllocationRegistry::new();
        REG.promote();

        let frame = [0_usize; 4];
        let mut slots = SlotMap::new();
        let outside = bounds_of(&frame).end + 0x1000;
        let features = extract(outside, Some(bounds_of(&frame)), &REG, &mut slots, 2);
        assert_eq!(features, {
            let mut expect = [0.0; NR_METRICS];
            expect[0] = 2.0;
            expect
        });

        // unreadable bounds behave the same
        let features = extract(frame.as_ptr() as usize, None, &REG, &mut slots, 2);
        assert_eq!(features[0], 2.0);
        assert_eq!(&features[1..], &[0.0; 9]);
    }

    #[test]
    fn slots_persist_in_first_seen_order() {
        static REG: AllocationRegistry = AllocationRegistry::new();
        REG.register(0xa000, 100);
        REG.register(0xb000, 200);
        REG.promote();

        let mut slots = SlotMap::new();

        let first_call = [0xa000_usize];
        let features = extract(
            first_call.as_ptr() as usize,
            Some(bounds_of(&first_call)),
            &REG,
            &mut slots,
            1,
        );
        assert_eq!(features[1], 100.0);

        // B appears ahead of A on the second call, but A keeps slot 1.
        let second_call = [0xb000_usize, 0xa000];
        let features = extract(
            second_call.as_ptr() as usize,
            Some(bounds_of(&second_call)),
            &REG,
            &mut slots,
            1,
        );
        assert_eq!(features[1], 100.0);
        assert_eq!(features[2], 200.0);
    }

    #[test]
    fn sizes_track_the_registry_not_the_slot_map() {
        static REG: AllocationRegistry = AllocationRegistry::new();
        REG.register(0xa000, 100);
        REG.promote();

        let mut slots = SlotMap::new();
        let frame = [0xa000_usize];
        extract(
            frame.as_ptr() as usize,
            Some(bounds_of(&frame)),
            &REG,
            &mut slots,
            1,
        );

        // the address is reused by a larger allocation
        REG.register(0xa000, 999);
        let features = extract(
            frame.as_ptr() as usize,
            Some(bounds_of(&frame)),
            &REG,
            &mut slots,
            1,
        );
        assert_eq!(features[1], 999.0);
    }

    #[test]
    fn only_nine_addresses_get_slots() {
        static REG: AllocationRegistry = AllocationRegistry::new();
        let mut frame = [0_usize; 12];
        for i in 0..12 {
            let addr = 0x10_000 + i * 0x100;
            REG.register(addr, (i + 1) * 10);
            frame[i] = addr;
        }
        REG.promote();

        let mut slots = SlotMap::new();
        let features = extract(
            frame.as_ptr() as usize,
            Some(bounds_of(&frame)),
            &REG,
            &mut slots,
            1,
        );

        for slot in 1..NR_METRICS {
            assert_eq!(features[slot], (slot * 10) as f64);
        }

        // the tenth address never got a slot
        let mut later = SlotMap::new();
        for i in 0..9 {
            later.resolve(frame[i]);
        }
        assert_eq!(later.resolve(frame[9]), None);
        assert_eq!(later.resolve(frame[0]), Some(1));
    }
}
