//! The three event kinds the shim tracks.
//!
//! Two of them are hardware counters driven through a grouped
//! `perf_event_open` set; the third is the package energy counter, which
//! lives on its own PMU and is read separately (see [`crate::energy`]).

use perf_event_open_sys::bindings;

/// One measured quantity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Instructions,
    CacheMisses,
    Energy,
}

/// The fixed order in which every record (prediction, measurement,
/// monitoring sample) lists its values. Matches [`CSV_HEADER`].
pub const EVENT_ORDER: [EventKind; 3] = [
    EventKind::CacheMisses,
    EventKind::Energy,
    EventKind::Instructions,
];

/// The events opened as a hardware counter group.
pub const HW_EVENTS: [EventKind; 2] = [EventKind::Instructions, EventKind::CacheMisses];

/// Header line shared by the monitoring, measurement, and prediction files.
pub const CSV_HEADER: &str = "Cache_Misses,Energy,Instructions,";

impl EventKind {
    /// Stable name, used as a map key and in log messages.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Instructions => "Instructions",
            EventKind::CacheMisses => "Cache-Misses",
            EventKind::Energy => "Energy",
        }
    }

    /// The `perf_event_attr::config` value for hardware events, `None` for
    /// the energy counter.
    pub fn hw_config(self) -> Option<u64> {
        match self {
            EventKind::Instructions => Some(bindings::PERF_COUNT_HW_INSTRUCTIONS as u64),
            EventKind::CacheMisses => Some(bindings::PERF_COUNT_HW_CACHE_MISSES as u64),
            EventKind::Energy => None,
        }
    }
}
