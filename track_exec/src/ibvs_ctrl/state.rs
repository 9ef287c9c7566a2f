//! # IBVS controller state

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::Serialize;
use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Number of per-axis errors kept for the derivative
pub const AXIS_HISTORY_LEN: usize = 6;

/// Number of error magnitudes kept for damping and statistics
pub const ERROR_WINDOW_LEN: usize = 30;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerState {
    /// Units: pixel seconds
    pub integral_u: f64,

    /// Units: pixel seconds
    pub integral_v: f64,

    /// Recent horizontal errors, oldest first
    pub error_u_history: [f64; AXIS_HISTORY_LEN],

    /// Recent vertical errors, oldest first
    pub error_v_history: [f64; AXIS_HISTORY_LEN],

    /// Recent error magnitudes, oldest first
    pub error_window: VecDeque<f64>,
}

/// Statistics over the error magnitude window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ErrorStats {
    /// Units: pixels
    pub current_error: f64,

    /// Units: pixels
    pub avg_error: f64,

    /// Units: pixels
    pub min_error: f64,

    /// Units: pixels
    pub max_error: f64,

    /// The last five errors are small and steady
    pub is_converged: bool,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ControllerState {
    /// Record the errors of a new tick.
    pub fn push(&mut self, error_u: f64, error_v: f64, magnitude: f64) {
        self.error_window.push_back(magnitude);
        while self.error_window.len() > ERROR_WINDOW_LEN {
            self.error_window.pop_front();
        }

        self.error_u_history.rotate_left(1);
        self.error_v_history.rotate_left(1);
        self.error_u_history[AXIS_HISTORY_LEN - 1] = error_u;
        self.error_v_history[AXIS_HISTORY_LEN - 1] = error_v;
    }

    /// Mean of the last `n` error magnitudes, if there are at least `n`.
    pub fn recent_mean(&self, n: usize) -> Option<f64> {
        if n == 0 || self.error_window.len() < n {
            return None;
        }

        Some(self.error_window.iter().rev().take(n).sum::<f64>() / n as f64)
    }

    pub fn error_stats(&self) -> Option<ErrorStats> {
        let current_error = *self.error_window.back()?;

        let n = self.error_window.len() as f64;
        let mut min_error = std::f64::INFINITY;
        let mut max_error = std::f64::NEG_INFINITY;
        let mut sum = 0.0;
        for e in self.error_window.iter() {
            min_error = min_error.min(*e);
            max_error = max_error.max(*e);
            sum += e;
        }

        let is_converged = match self.recent_mean(5) {
            Some(mean) => {
                let recent = self.error_window.iter().rev().take(5);
                let (lo, hi) = recent.fold((std::f64::INFINITY, std::f64::NEG_INFINITY), |(lo, hi), e| {
                    (lo.min(*e), hi.max(*e))
                });
                hi - lo < 2.0 && mean < 10.0
            }
            None => false,
        };

        Some(ErrorStats {
            current_error,
            avg_error: sum / n,
            min_error,
            max_error,
            is_converged,
        })
    }
}
