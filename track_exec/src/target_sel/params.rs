//! # Target selector parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::Deserialize;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TargetSelParams {
    /// Number of consecutive ticks the locked track may be missing before the largest balloon is
    /// followed instead
    pub max_lost_frames: u32,
}

impl Default for TargetSelParams {
    fn default() -> Self {
        Self {
            max_lost_frames: 10,
        }
    }
}
