//! # Tracking library.
//!
//! This library allows other crates in the workspace to access items defined inside the tracking
//! crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Detection client - receives detection batches from the vision pipeline
pub mod det_client;

/// Tracking events delivered to the owning application
pub mod events;

/// IBVS controller - converts the pixel error of the target into axis speed demands
pub mod ibvs_ctrl;

/// Executable parameters
pub mod params;

/// Servo driver - smoothing, limits and sign conventions of the two axes
pub mod servo_drv;

/// Servo interface - Modbus RTU transport to the servo drives
pub mod servo_if;

/// Target selector - picks the balloon to follow from each detection batch
pub mod target_sel;

/// Tracking supervisor - runs the fixed cadence control loop
pub mod track_sup;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::sync::{Mutex, MutexGuard};

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Lock a mutex, taking the data anyway if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(e) => {
            log::warn!("Recovering poisoned mutex");
            e.into_inner()
        }
    }
}
