#![forbid(unsafe_code)]

//! Lock helpers shared by the session internals.
//!
//! No lock in this crate is held while user code runs, so a poisoned mutex
//! only means some unrelated thread panicked; the protected state is still
//! consistent and we keep going.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, WaitTimeoutResult};
use std::time::Duration;

#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub(crate) fn wait<'a, T>(cvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub(crate) fn wait_timeout<'a, T>(
    cvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
    cvar.wait_timeout(guard, timeout)
        .unwrap_or_else(PoisonError::into_inner)
}
