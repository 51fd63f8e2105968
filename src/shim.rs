//! The dynamic-interposition surface.
//!
//! This module exports the symbols the dynamic linker resolves ahead of
//! libc and libgomp when the shim is preloaded: `malloc`, `GOMP_parallel`,
//! and the thread-count pair. Each hook forwards to the next definition of
//! its symbol (found with `dlsym(RTLD_NEXT, …)` and cached) and layers the
//! shim's bookkeeping around the call. The host program never has to know
//! any of this is happening; a hook must succeed at its underlying job
//! even when instrumentation is unavailable.
//!
//! Startup runs from an `.init_array` entry after the host's own
//! initializers, and only arms itself when the process was actually
//! started with `LD_PRELOAD`; linked into an ordinary binary (the test
//! harness, say) the shim stays dormant: the registry is never promoted,
//! no counters are opened, and intercepted dispatches are forwarded
//! untouched.

use std::ffi::{c_int, c_uint, c_void, CStr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::output;
use crate::pipeline::Pipeline;
use crate::predictor::PredictorKind;
use crate::registry::AllocationRegistry;
use crate::{logging, reentry, sampler};

/// The process-wide allocation registry, fed by the `malloc` hook.
pub static REGISTRY: AllocationRegistry = AllocationRegistry::new();

static PIPELINE: OnceLock<Pipeline> = OnceLock::new();

/// Last observed OpenMP thread count, for feature slot 0.
static THREAD_COUNT: Mutex<c_int> = Mutex::new(1);

/// The number of threads the extractor should report.
pub fn thread_count() -> u32 {
    let guard = match THREAD_COUNT.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    (*guard).max(1) as u32
}

fn cache_thread_count(n: c_int) {
    let mut guard = match THREAD_COUNT.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = n;
}

/// Resolution of the interposed symbols' next definitions.
mod host {
    use super::*;

    type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
    pub type WorkFn = unsafe extern "C" fn(*mut c_void);
    type ParallelFn = unsafe extern "C" fn(WorkFn, *mut c_void, c_uint, c_uint);
    type GetThreadsFn = unsafe extern "C" fn() -> c_int;
    type SetThreadsFn = unsafe extern "C" fn(c_int);

    fn next_symbol(cache: &AtomicUsize, name: &CStr) -> *mut c_void {
        let cached = cache.load(Ordering::Relaxed);
        if cached != 0 {
            return cached as *mut c_void;
        }
        let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
        if !addr.is_null() {
            cache.store(addr as usize, Ordering::Relaxed);
        }
        addr
    }

    pub unsafe fn malloc(size: usize) -> *mut c_void {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let addr = next_symbol(&NEXT, c"malloc");
        if addr.is_null() {
            // No allocator to forward to; nothing sensible is possible.
            libc::abort();
        }
        let real: MallocFn = std::mem::transmute(addr);
        real(size)
    }

    pub unsafe fn gomp_parallel(
        work: WorkFn,
        payload: *mut c_void,
        num_threads: c_uint,
        flags: c_uint,
    ) {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let addr = next_symbol(&NEXT, c"GOMP_parallel");
        if addr.is_null() {
            // No runtime underneath us; run the region body inline rather
            // than swallow it.
            log::warn!("GOMP_parallel has no next definition; running the region inline");
            work(payload);
            return;
        }
        let real: ParallelFn = std::mem::transmute(addr);
        real(work, payload, num_threads, flags)
    }

    pub unsafe fn omp_get_num_threads() -> Option<c_int> {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let addr = next_symbol(&NEXT, c"omp_get_num_threads");
        if addr.is_null() {
            return None;
        }
        let real: GetThreadsFn = std::mem::transmute(addr);
        Some(real())
    }

    pub unsafe fn omp_set_num_threads(n: c_int) {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let addr = next_symbol(&NEXT, c"omp_set_num_threads");
        if addr.is_null() {
            return;
        }
        let real: SetThreadsFn = std::mem::transmute(addr);
        real(n)
    }
}

/// Interposed `malloc`: forward, then record the allocation, unless this
/// thread is already inside shim code, in which case the allocation is the
/// shim's own and is not workload.
///
/// # Safety
/// Called by the platform with the usual `malloc` contract.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let address = host::malloc(size);
    if !address.is_null() && !reentry::active() {
        reentry::guarded(|| REGISTRY.register(address as usize, size));
    }
    address
}

/// Interposed `GOMP_parallel`: run the region through the pipeline when
/// the shim is armed, plain forwarding otherwise.
///
/// # Safety
/// Called by the host's OpenMP-compiled code with libgomp's contract:
/// `work` must be a valid region body for `payload`.
#[no_mangle]
pub unsafe extern "C" fn GOMP_parallel(
    work: host::WorkFn,
    payload: *mut c_void,
    num_threads: c_uint,
    flags: c_uint,
) {
    let dispatch = || host::gomp_parallel(work, payload, num_threads, flags);
    match PIPELINE.get() {
        Some(pipeline) => {
            pipeline.region_call(work as usize, payload as usize, thread_count(), dispatch)
        }
        None => dispatch(),
    }
}

/// Interposed `omp_get_num_threads`: forward and remember the answer.
///
/// # Safety
/// Called with libgomp's contract.
#[no_mangle]
pub unsafe extern "C" fn omp_get_num_threads() -> c_int {
    match host::omp_get_num_threads() {
        Some(n) => {
            cache_thread_count(n);
            n
        }
        None => thread_count() as c_int,
    }
}

/// Interposed `omp_set_num_threads`: forward and remember the request.
///
/// # Safety
/// Called with libgomp's contract.
#[no_mangle]
pub unsafe extern "C" fn omp_set_num_threads(num_threads: c_int) {
    host::omp_set_num_threads(num_threads);
    cache_thread_count(num_threads);
}

/// Whether this process was started with the shim preloaded. Without
/// `LD_PRELOAD` the crate is just a library in some binary and must not
/// take over its counters or working directory.
fn preloaded() -> bool {
    std::env::var_os("LD_PRELOAD").is_some()
}

extern "C" fn shim_setup() {
    if !preloaded() {
        return;
    }

    reentry::guarded(|| {
        logging::init();

        let kind = PredictorKind::from_env();
        log::info!("predictor backend: {}", kind.name());

        REGISTRY.promote();

        let root = Path::new(output::OUTPUT_ROOT);
        let pipeline = match Pipeline::start_up(root, kind) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                log::error!("cannot start measurement: {}", e);
                std::process::exit(1);
            }
        };
        let pipeline = PIPELINE.get_or_init(|| pipeline);

        let monitoring = match output::create_file(root.join("monitoring.csv")) {
            Ok(writer) => writer,
            Err(e) => {
                log::error!("cannot create the monitoring file: {}", e);
                std::process::exit(1);
            }
        };
        if let Err(e) = sampler::spawn(pipeline, monitoring) {
            log::warn!("cannot start the background sampler: {}", e);
        }
    });
}

extern "C" fn shim_teardown() {
    sampler::STOP.store(true, Ordering::Relaxed);
}

// Run after every other initializer (the host's included), before main.
#[used]
#[link_section = ".init_array"]
static SHIM_SETUP: extern "C" fn() = shim_setup;

#[used]
#[link_section = ".fini_array"]
static SHIM_TEARDOWN: extern "C" fn() = shim_teardown;
