//! Shared utilities: IPv4 arithmetic, name validation, lock helpers.

pub mod ip_utils;
pub mod validation;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use validation::{validate_interface_name, validate_node_name};

/// Lock a mutex, keeping the data if a worker panicked while holding it
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
