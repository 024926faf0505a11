#[macro_use]
pub mod named;

pub mod fmt;
pub mod rustls;

pub use function_name::named;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `m`, ignoring poisoning. Guarded state here is always left consistent
/// between statements, so a panic elsewhere doesn't invalidate it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
