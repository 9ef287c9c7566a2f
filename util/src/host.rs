//! Host platform (linux for example) utility functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::env;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Environment variable pointing at the root of the software tree.
pub const SW_ROOT_ENV_VAR: &str = "PANTILT_SW_ROOT";

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Get the root directory of the software tree, which contains the `params` and `sessions`
/// directories.
pub fn get_pantilt_sw_root() -> Result<PathBuf, env::VarError> {
    env::var(SW_ROOT_ENV_VAR).map(PathBuf::from)
}

/// Short description of the platform this executable was built for, for example
/// `linux-aarch64`.
pub fn get_platform() -> String {
    format!("{}-{}", env::consts::OS, env::consts::ARCH)
}
