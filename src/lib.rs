//! A performance-prediction shim for OpenMP programs on Linux.
//!
//! This crate builds as a `cdylib` meant to be loaded into an unmodified
//! OpenMP program via `LD_PRELOAD`. It interposes on `malloc` and on the
//! GNU OpenMP region launcher (`GOMP_parallel`) and, for every parallel
//! region the host enters:
//!
//! -   extracts a workload description from the region's opaque argument
//!     payload, by scanning the calling thread's stack for values that equal
//!     the base address of a previously observed heap allocation,
//! -   asks a per-region online regression model to predict the hardware
//!     and energy counters of the upcoming execution,
//! -   measures the same counters over the actual execution with a grouped
//!     [`perf_event_open`][man] counter set plus a package RAPL counter, and
//! -   feeds the measured deltas back into the model.
//!
//! Predictions, measurements, and the feature vectors that produced them are
//! written to CSV files under `./csvs/` for post-mortem analysis, and a
//! background thread samples system-wide counter deltas every 50 ms.
//!
//! The crate also builds as an `rlib` so the individual pieces (the
//! [allocation registry](registry), the [metrics extractor](extract), the
//! [counter group](counters), the [predictors](predictor)) can be
//! driven directly from tests without interposition.
//!
//! Nothing here requires cooperation from the host program; the only
//! configuration is through environment variables (`PREDICTOR`, `LOGLEVEL`).
//!
//! [man]: http://man7.org/linux/man-pages/man2/perf_event_open.2.html

pub mod counters;
pub mod energy;
pub mod events;
pub mod extract;
pub mod logging;
pub mod output;
pub mod pipeline;
pub mod predictor;
pub mod registry;
pub mod sampler;
pub mod shim;
pub mod topology;

mod error;
mod reentry;

pub use crate::error::Error;
pub use crate::extract::NR_METRICS;
pub use crate::registry::{AllocationRegistry, BOOTSTRAP_CAP};

use std::io;

/// Produce an `io::Result` from an errno-style system call.
///
/// An 'errno-style' system call is one that reports failure by returning -1
/// and setting the C `errno` value when an error occurs.
pub(crate) fn check_errno_syscall<F, R>(f: F) -> io::Result<R>
where
    F: FnOnce() -> R,
    R: PartialOrd + Default,
{
    let result = f();
    if result < R::default() {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// View a `u64` slice as the byte buffer a grouped counter read fills in.
///
/// Storing a `u64` initializes all its bytes, so no uninitialized memory is
/// ever exposed to the caller.
pub(crate) fn as_byte_slice_mut(slice: &mut [u64]) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut(
            slice.as_mut_ptr() as *mut u8,
            std::mem::size_of_val(slice),
        )
    }
}

#[test]
fn errno_check_passes_values_through() {
    assert_eq!(check_errno_syscall(|| 7).unwrap(), 7);
    assert!(check_errno_syscall(|| -1).is_err());
}
