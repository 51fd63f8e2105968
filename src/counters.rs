//! Grouped hardware counters for one traced process.
//!
//! A [`CounterGroup`] owns one perf counter group per CPU PMU. Within each
//! group the first counter that opens becomes the group leader; reset,
//! enable, and disable are issued to the leader with `PERF_IOC_FLAG_GROUP`
//! so the members cover exactly the same period of execution, and a single
//! grouped `read(2)` returns every member's value at once.
//!
//! On heterogeneous machines the same logical event exists once per PMU;
//! [`CounterGroup::read`] sums those, so callers always see one value per
//! [`EventKind`] no matter what the machine looks like.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, FromRawFd};

use libc::pid_t;
use perf_event_open_sys as sys;
use sys::bindings::perf_event_attr;

use crate::events::{EventKind, HW_EVENTS};
use crate::topology::{self, Topology};
use crate::{as_byte_slice_mut, check_errno_syscall};

/// One value per event, as of one read.
pub type Snapshot = HashMap<EventKind, u64>;

// A grouped read returns `nr` followed by (value, id) pairs; with two
// events per group this is far more room than the kernel will ever use.
const READ_BUF_WORDS: usize = 64;

/// Open one counter, joining the group led by `group_fd` (or starting a new
/// group if `group_fd` is -1). Returns the counter's file together with the
/// id the kernel will report for it in grouped reads.
fn open_counter(type_: u32, config: u64, pid: pid_t, group_fd: i32) -> io::Result<(File, u64)> {
    let mut attrs = perf_event_attr {
        size: std::mem::size_of::<perf_event_attr>() as u32,
        type_,
        config,
        ..perf_event_attr::default()
    };

    attrs.set_disabled(1);
    attrs.set_exclude_kernel(1); // don't count time in kernel
    attrs.set_exclude_hv(1); // don't count time in hypervisor
    attrs.set_inherit(1); // follow threads the host spawns
    attrs.set_inherit_thread(1);

    // Arrange to be able to identify the counters we read back.
    attrs.read_format =
        (sys::bindings::PERF_FORMAT_GROUP | sys::bindings::PERF_FORMAT_ID) as u64;

    let fd = check_errno_syscall(|| unsafe {
        sys::perf_event_open(&mut attrs, pid, -1, group_fd, 0)
    })?;
    let file = unsafe { File::from_raw_fd(fd) };

    let mut id = 0_u64;
    check_errno_syscall(|| unsafe { sys::ioctls::ID(file.as_raw_fd(), &mut id) })?;

    Ok((file, id))
}

/// The counters opened against a single PMU, as one kernel counter group.
struct PmuCounters {
    /// The group leader. Group-wide ioctls and grouped reads go through
    /// this descriptor.
    leader: File,

    /// The remaining members. Held only so their descriptors stay open for
    /// the lifetime of the group.
    _siblings: Vec<File>,

    /// Kernel-assigned counter id to the event it counts.
    ids: HashMap<u64, EventKind>,
}

impl PmuCounters {
    /// Open every hardware event against one PMU. `config_for` maps an
    /// event to the `perf_event_attr::config` encoding this PMU expects.
    ///
    /// Individual events failing to open is tolerated; returns `None` only
    /// if not a single counter opened.
    fn open(
        pid: pid_t,
        label: &str,
        config_for: impl Fn(EventKind) -> u64,
    ) -> Option<PmuCounters> {
        let mut leader: Option<File> = None;
        let mut siblings = Vec::new();
        let mut ids = HashMap::new();

        for event in HW_EVENTS {
            let group_fd = leader.as_ref().map_or(-1, |f| f.as_raw_fd());
            match open_counter(
                sys::bindings::PERF_TYPE_HARDWARE,
                config_for(event),
                pid,
                group_fd,
            ) {
                Ok((file, id)) => {
                    ids.insert(id, event);
                    if leader.is_none() {
                        leader = Some(file);
                    } else {
                        siblings.push(file);
                    }
                }
                Err(e) => {
                    log::warn!(
                        "[{}] failed to open counter for {} (pid {}): {}",
                        label,
                        event.name(),
                        pid,
                        e
                    );
                }
            }
        }

        let leader = leader?;
        let group = PmuCounters {
            leader,
            _siblings: siblings,
            ids,
        };
        if let Err(e) = group.start() {
            log::warn!("[{}] failed to start counter group: {}", label, e);
        }
        Some(group)
    }

    /// Zero every member and let the whole group begin counting.
    fn start(&self) -> io::Result<()> {
        self.group_ioctl(sys::ioctls::RESET)?;
        self.group_ioctl(sys::ioctls::ENABLE)
    }

    /// Perform some group-wide ioctl.
    ///
    /// `f` must be a syscall that sets `errno` and returns `-1` on failure.
    fn group_ioctl(&self, f: unsafe fn(i32, u32) -> i32) -> io::Result<()> {
        check_errno_syscall(|| unsafe {
            f(self.leader.as_raw_fd(), sys::bindings::PERF_IOC_FLAG_GROUP)
        })
        .map(|_| ())
    }

    /// One grouped read: kernel counter id to raw value.
    fn read_raw(&mut self) -> io::Result<HashMap<u64, u64>> {
        // Since we passed `PERF_FORMAT_{ID,GROUP}`, the data has the form:
        //
        //     struct read_format {
        //         u64 nr;            /* The number of events */
        //         struct {
        //             u64 value;     /* The value of the event */
        //             u64 id;        /* if PERF_FORMAT_ID */
        //         } values[nr];
        //     };
        let mut data = [0_u64; READ_BUF_WORDS];
        let bytes = self.leader.read(as_byte_slice_mut(&mut data))?;

        let nr = data[0] as usize;
        if bytes < (1 + 2 * nr) * std::mem::size_of::<u64>() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "grouped counter read returned fewer values than its header claims",
            ));
        }

        let mut raw = HashMap::with_capacity(nr);
        for i in 0..nr {
            let value = data[1 + 2 * i];
            let id = data[2 + 2 * i];
            raw.insert(id, value);
        }
        Ok(raw)
    }

    /// Fold one grouped read into `out`, translating counter ids back to
    /// event names.
    fn read_into(&mut self, out: &mut Snapshot) -> io::Result<()> {
        let raw = self.read_raw()?;
        fold_raw(&self.ids, &raw, out);
        Ok(())
    }
}

/// Accumulate one PMU's raw id→value read into a per-event snapshot.
/// Unknown ids are logged and discarded; members missing from the read
/// simply contribute nothing.
fn fold_raw(ids: &HashMap<u64, EventKind>, raw: &HashMap<u64, u64>, out: &mut Snapshot) {
    for (id, value) in raw {
        match ids.get(id) {
            Some(event) => *out.entry(*event).or_insert(0) += value,
            None => log::warn!("unknown counter id {} (value {}) in grouped read", id, value),
        }
    }
}

impl Drop for PmuCounters {
    fn drop(&mut self) {
        unsafe {
            sys::ioctls::DISABLE(self.leader.as_raw_fd(), sys::bindings::PERF_IOC_FLAG_GROUP);
        }
        // The descriptors close with their `File`s.
    }
}

/// All hardware counters for one traced process, across however many CPU
/// PMUs the machine has.
pub struct CounterGroup {
    pmus: Vec<PmuCounters>,

    /// The last successful read. Handed out again when a read transiently
    /// fails, so callers always get a usable snapshot.
    cache: Snapshot,
}

impl CounterGroup {
    /// Open counters for `pid` according to the detected PMU topology.
    ///
    /// Returns `None` if no counter could be opened at all; partial failure
    /// (one PMU of several, one event of several) is logged and tolerated.
    pub fn open(pid: pid_t) -> Option<CounterGroup> {
        Self::open_with(pid, &topology::detect())
    }

    /// As [`open`](Self::open), with an explicit topology.
    pub fn open_with(pid: pid_t, topology: &Topology) -> Option<CounterGroup> {
        let mut pmus = Vec::new();

        match topology {
            Topology::SinglePmu => {
                if let Some(group) = PmuCounters::open(pid, "cpu", |ev| {
                    ev.hw_config().expect("hardware event without a config")
                }) {
                    pmus.push(group);
                }
            }
            Topology::MultiPmu(list) => {
                for pmu in list {
                    let opened = PmuCounters::open(pid, pmu.name(), |ev| {
                        pmu.extended_config(ev.hw_config().expect("hardware event without a config"))
                    });
                    if let Some(group) = opened {
                        log::debug!("counters running on PMU {} for pid {}", pmu.name(), pid);
                        pmus.push(group);
                    }
                }
            }
        }

        if pmus.is_empty() {
            log::warn!("failed to open performance counters for pid {}", pid);
            return None;
        }

        let cache = HW_EVENTS.iter().map(|ev| (*ev, 0)).collect();
        Some(CounterGroup { pmus, cache })
    }

    /// Read every PMU and present one summed value per event.
    ///
    /// A transient read failure returns the previous snapshot unchanged, so
    /// the values a caller sees never move backwards.
    pub fn read(&mut self) -> Snapshot {
        let mut fresh: Snapshot = HW_EVENTS.iter().map(|ev| (*ev, 0)).collect();

        for group in &mut self.pmus {
            if let Err(e) = group.read_into(&mut fresh) {
                log::warn!("grouped counter read failed: {}", e);
                return self.cache.clone();
            }
        }

        self.cache = fresh.clone();
        fresh
    }
}

impl std::fmt::Debug for CounterGroup {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "CounterGroup {{ pmus: {} }}", self.pmus.len())
    }
}
