//! # Logger
//!
//! Sets up logging for the tracking executable:
//!
//! - The console and the session log file get every record except bus traffic. Records from
//!   the control loop and detection feed threads are tagged with the thread name.
//! - Every Modbus frame exchanged with the servo drives is logged under `BUS_TARGET` into its own
//!   `modbus.log` in the session directory, so the main log stays readable at 10 Hz.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External imports
use log::{self, info};
use fern;
use colored::{ColoredString, Colorize};
use std::thread;
use thiserror::Error;

// Internal imports
use crate::session;

// Re-exports
pub use log::LevelFilter;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Log target of the raw Modbus frames.
pub const BUS_TARGET: &str = "modbus";

/// Name of the bus log file inside the session directory
pub const BUS_LOG_FILE_NAME: &str = "modbus.log";

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors associated with initialising the logger.
#[derive(Debug, Error)]
pub enum LoggerInitError {
    #[error("Expected a log level of at least `INFO`, found `{0}`")]
    InvalidMinLogLevel(log::LevelFilter),

    #[error("Error initialising the log file: {0}")]
    LogFileInitError(std::io::Error),

    #[error("Error initialising the bus log file: {0}")]
    BusLogFileInitError(std::io::Error),

    #[error("An error occured while setting up the logger: {0}")]
    FernInitError(log::SetLoggerError)
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Initialise the logger for this execution.
///
/// `min_level` applies to the console and session log, and must be at least `Info`.
/// `bus_level` applies to the Modbus frame log, use `Trace` to record every frame or `Off` to
/// disable it.
///
/// # Safety
///
/// - This function must only be called once to prevent corrupting logs.
pub fn logger_init(
    min_level: self::LevelFilter,
    bus_level: self::LevelFilter,
    session: &session::Session
) -> Result<(), LoggerInitError> {

    if min_level < log::Level::Info {
        return Err(LoggerInitError::InvalidMinLogLevel(min_level))
    }

    let log_file = fern::log_file(session.log_file_path.clone())
        .map_err(LoggerInitError::LogFileInitError)?;
    let bus_log_path = session.session_root.join(BUS_LOG_FILE_NAME);
    let bus_file = fern::log_file(bus_log_path.clone())
        .map_err(LoggerInitError::BusLogFileInitError)?;

    // Console and session log
    let main_dispatch = fern::Dispatch::new()
        .filter(|metadata| !is_bus_target(metadata.target()))
        .format(|out, message, record| {
            let thread = thread::current();
            let tag = thread_tag(thread.name());

            // If debug or trace include the target, otherwise don't include it
            if record.level() > log::Level::Info {
                out.finish(format_args!(
                    "[{:10.6} {}{}] {}: {}",
                    session::get_elapsed_seconds(),
                    level_to_str(record.level()),
                    tag,
                    record.target(),
                    message
                ))
            }
            else {
                out.finish(format_args!(
                    "[{:10.6} {}{}] {}",
                    session::get_elapsed_seconds(),
                    level_to_str(record.level()),
                    tag,
                    message
                ))
            }
        })
        .level(min_level)
        .level_for("serialport", LevelFilter::Info)
        .chain(std::io::stdout())
        .chain(log_file);

    // Modbus frames, one per line with the session time
    let bus_dispatch = fern::Dispatch::new()
        .filter(|metadata| is_bus_target(metadata.target()))
        .format(|out, message, _| {
            out.finish(format_args!(
                "{:10.6} {}",
                session::get_elapsed_seconds(),
                message
            ))
        })
        .level(bus_level)
        .chain(bus_file);

    fern::Dispatch::new()
        .chain(main_dispatch)
        .chain(bus_dispatch)
        .apply()
        .map_err(LoggerInitError::FernInitError)?;

    info!("Logging initialised");
    info!("    Session epoch: {}", session::get_epoch());
    info!("    Log level: {:?}", min_level);
    info!("    Log file path: {:?}", session.log_file_path);
    info!("    Bus log level: {:?}", bus_level);
    info!("    Bus log file path: {:?}", bus_log_path);
    info!("    Platform: {}", crate::host::get_platform());

    Ok(())
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn is_bus_target(target: &str) -> bool {
    target == BUS_TARGET
}

/// Tag for records from named worker threads. The main thread is left untagged.
fn thread_tag(name: Option<&str>) -> String {
    match name {
        Some("main") | None => String::new(),
        Some(n) => format!(" {}", n),
    }
}

/// Get the string representation of a log level
fn level_to_str(level: log::Level) -> ColoredString {
    match level {
        log::Level::Trace => "TRC".dimmed().italic(),
        log::Level::Debug => "DBG".dimmed(),
        log::Level::Info  => "INF".normal(),
        log::Level::Warn  => "WRN".yellow(),
        log::Level::Error => "ERR".red().bold()
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bus_records_are_split() {
        assert!(is_bus_target(BUS_TARGET));
        assert!(!is_bus_target("track_lib::servo_if"));
        assert!(!is_bus_target("serialport"));
    }

    #[test]
    fn test_thread_tag() {
        assert_eq!(thread_tag(Some("main")), "");
        assert_eq!(thread_tag(None), "");
        assert_eq!(thread_tag(Some("track_ctrl")), " track_ctrl");
    }
}
