//! Main tracking executable entry point.
//!
//! # Architecture
//!
//! The executable consists of:
//!
//!     - The tracking supervisor, which owns the servo transport and runs the control loop on its
//!       own thread
//!     - The detection client, which reads detection batches from stdin and hands them to the
//!       supervisor
//!     - The main loop, which:
//!         - Executes telecommands from the script, if one was given
//!         - Reports the tracking status at 1 Hz
//!
//! With no script the executable connects to the drives, tracks the largest balloon and exits
//! when the detection feed closes.

// ---------------------------------------------------------------------------
// USE MODULES FROM LIBRARY
// ---------------------------------------------------------------------------

use track_lib::{
    det_client::DetClient,
    params::TrackExecParams,
    track_sup::{TrackSup, TrackingState},
};

mod tc_processor;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{
    eyre::{eyre, WrapErr},
    Report,
};
use log::{debug, info, warn};
use std::env;
use std::io::{self, BufReader};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// Internal
use util::{
    host,
    logger::{logger_init, LevelFilter},
    script_interpreter::{PendingTcs, ScriptInterpreter},
    session::{self, Session},
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Target period of one main loop cycle.
const CYCLE_PERIOD_S: f64 = 0.10;

/// Period between status reports.
const STATUS_PERIOD_S: f64 = 1.0;

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    // ---- EARLY INITIALISATION ----

    // Initialise session
    let session = Session::new("track_exec", "sessions").wrap_err("Failed to create the session")?;

    // Initialise logger, with every Modbus frame going to the bus log
    logger_init(LevelFilter::Debug, LevelFilter::Trace, &session)
        .wrap_err("Failed to initialise logging")?;

    // Log information on this execution.
    info!("Pan-Tilt Balloon Tracker\n");
    info!("Running on: {}", host::get_platform());
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let params: TrackExecParams =
        util::params::load("track_exec.toml").wrap_err("Could not load track_exec params")?;
    params
        .are_valid()
        .wrap_err("The track_exec params are invalid")?;

    info!("Exec parameters loaded");

    // ---- INITIALISE TC SOURCE ----

    let args: Vec<String> = env::args().collect();

    debug!("CLI arguments: {:?}", args);

    let mut tc_source = match args.len() {
        2 => {
            info!("Loading script from \"{}\"", &args[1]);

            let si = ScriptInterpreter::new(&args[1]).wrap_err("Failed to load script")?;

            info!(
                "Loaded script lasts {:.02} s and contains {} TCs\n",
                si.get_duration(),
                si.get_num_tcs()
            );

            TcSource::Script(si)
        }
        1 => {
            info!("No script provided, tracking the largest balloon until the feed closes\n");
            TcSource::Feed
        }
        n => {
            return Err(eyre!(
                "Expected either zero or one argument, found {}",
                n - 1
            ))
        }
    };

    // ---- INITIALISE TRACKING ----

    let sup = Arc::new(TrackSup::new(&params));
    info!("TrackSup initialised");

    let feed_sup = sup.clone();
    let det_client = DetClient::spawn(BufReader::new(io::stdin()), move |d| {
        feed_sup.set_detections(d)
    })
    .wrap_err("Failed to start the detection client")?;
    info!("DetClient initialised");

    if let TcSource::Feed = tc_source {
        if !sup.connect() {
            return Err(eyre!("Could not connect to the servo drives"));
        }
        if !sup.start(None) {
            return Err(eyre!("Could not start tracking"));
        }
    }

    // ---- MAIN LOOP ----

    info!("Begining main loop\n");

    let cycle_period = Duration::from_secs_f64(CYCLE_PERIOD_S);
    let status_period = Duration::from_secs_f64(STATUS_PERIOD_S);
    let mut last_status_instant = Instant::now();

    loop {
        let cycle_start_instant = Instant::now();

        // ---- TELECOMMAND PROCESSING ----

        match tc_source {
            TcSource::Script(ref mut si) => match si.get_pending_tcs() {
                PendingTcs::None => (),
                PendingTcs::Some(tc_vec) => {
                    for tc in tc_vec.iter() {
                        tc_processor::exec(&sup, tc);
                    }
                }
                PendingTcs::EndOfScript => {
                    info!("End of TC script reached, stopping");
                    break;
                }
            },
            TcSource::Feed => {
                if det_client.is_finished() {
                    info!("Detection feed closed, stopping");
                    break;
                }
            }
        }

        // ---- STATUS ----

        if last_status_instant.elapsed() >= status_period {
            let status = sup.status();
            info!(
                "{:?}: connected = {}, target = {:?}, speeds = ({}, {}) RPM, error = {:.1} px",
                status.state,
                status.connected,
                status.target_id,
                status.pan_speed,
                status.tilt_speed,
                status
                    .error_stats
                    .map(|s| s.current_error)
                    .unwrap_or(std::f64::NAN)
            );
            last_status_instant = Instant::now();
        }

        // ---- CYCLE MANAGEMENT ----

        let cycle_dur = Instant::now() - cycle_start_instant;

        match cycle_period.checked_sub(cycle_dur) {
            Some(d) => thread::sleep(d),
            None => warn!(
                "Cycle overran by {:.06} s",
                cycle_dur.as_secs_f64() - cycle_period.as_secs_f64()
            ),
        }
    }

    // ---- SHUTDOWN ----

    let status = sup.status();
    if status.state == TrackingState::EmergencyStopped {
        warn!("Exiting in the emergency stopped state");
    }
    session::save("track_status.json", status);

    sup.disconnect();

    info!("End of execution");

    session.exit();

    Ok(())
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Various sources for the telecommands incoming to the exec.
enum TcSource {
    /// No telecommands, track until the detection feed closes
    Feed,

    Script(ScriptInterpreter),
}
