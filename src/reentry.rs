//! Reentrancy guard for the interposed allocator.
//!
//! The shim's own code allocates: map inserts, CSV writes, counter reads.
//! Inside a preloaded process those allocations land back in the
//! interposed `malloc`, which must not re-enter the registry: the mutexes
//! are not reentrant, and the shim's internal allocations are not host
//! workload anyway. Every instrumentation section runs under this guard,
//! and the `malloc` hook forwards without recording while it is set.
//!
//! The flag is a const-initialized thread local of a type with no drop
//! glue, so touching it never allocates, even on a thread's first access.

use std::cell::Cell;

thread_local! {
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside shim code.
pub(crate) fn active() -> bool {
    ACTIVE.with(Cell::get)
}

/// Run `f` with allocation recording suppressed on this thread.
pub(crate) fn guarded<R>(f: impl FnOnce() -> R) -> R {
    ACTIVE.with(|flag| {
        let previous = flag.replace(true);
        let result = f();
        flag.set(previous);
        result
    })
}
