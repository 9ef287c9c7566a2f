//! # Telecommand processor module
//!
//! The telecommand processor executes operator TCs against the tracking supervisor.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, info, warn};

// Internal
use comms_if::tc::Tc;
use track_lib::track_sup::TrackSup;
use util::session;

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Execute a telecommand.
///
/// Returns the success reported by the supervisor.
pub(crate) fn exec(sup: &TrackSup, tc: &Tc) -> bool {
    debug!("Executing {:?}", tc);

    let ok = match tc {
        Tc::Connect => sup.connect(),
        Tc::Disconnect => sup.disconnect(),
        Tc::StartTracking(id) => sup.start(*id),
        Tc::StopTracking => sup.stop(),
        Tc::UpdateTarget(id) => {
            sup.update_tracking_target(*id);
            true
        }
        Tc::EmergencyStop => sup.emergency_stop(),
        Tc::Status => {
            let status = sup.status();
            match serde_json::to_string(&status) {
                Ok(s) => info!("Status: {}", s),
                Err(e) => warn!("Could not serialise the status: {}", e),
            }
            session::save_with_timestamp("track_status.json", status);
            true
        }
    };

    if !ok {
        warn!("{:?} failed", tc);
    }

    ok
}
