//! # Tracking script interpreter module
//!
//! This module provides an interpreter for tracking scripts, allowing telecommands to be executed
//! at set times. Each command in a script is a timestamp in seconds followed by a JSON telecommand
//! and terminated by a semicolon:
//!
//! ```text
//! 0.0: {"type": "CONNECT"};
//! 1.5: {"type": "START", "payload": {"id": 3}};
//! 30.0: {"type": "STOP"};
//! ```

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::fs;
use regex::RegexBuilder;
use thiserror::Error;

// Internal
use comms_if::tc::{Tc, TcParseError};
use crate::session::get_elapsed_seconds;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Matches `<time>: <tc>;` at the start of a line.
const COMMAND_REGEX: &str = r"^\s*(\d+(\.\d+)?)\s*:\s*([^;]*);";

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A command which is scripted to occur at a specific time.
#[derive(Debug)]
pub struct Command {
    /// The time the command is supposed to execute at
    exec_time_s: f64,

    /// The Telecommand to run
    tc: Tc
}

/// A script interpreter.
///
/// After initialising with the path to the script to run use `.get_pending_tcs` to
/// acquire a list of telecommands that need executing.
#[derive(Debug)]
pub struct ScriptInterpreter {
    _script_path: PathBuf,
    cmds: VecDeque<Command>
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Could not find the script at {0}")]
    ScriptNotFound(String),

    #[error("Could not load the script: {0}")]
    ScriptLoadError(std::io::Error),

    #[error("The script is empty (or is so bad it can't be read)")]
    ScriptEmpty,

    #[error(
        "Script contains an invalid timestamp: {0}. \
        Should be a float (like 1.0)")]
    InvalidTimestamp(String),

    #[error("Script contains an invalid TC at {0} s: {1}")]
    InvalidTc(f64, TcParseError),

    #[error("Could not build the script regex: {0}")]
    RegexError(regex::Error)
}

#[derive(Debug, PartialEq)]
pub enum PendingTcs {
    None,
    Some(Vec<Tc>),
    EndOfScript
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ScriptInterpreter {

    /// Create a new interpreter from the given script path.
    pub fn new<P: AsRef<Path>>(script_path: P) -> Result<Self, ScriptError> {

        // Get the path in a buffer
        let path = PathBuf::from(script_path.as_ref());
        
        // Check that the script file exists.
        if !path.exists() {
            return Err(
                ScriptError::ScriptNotFound(path.display().to_string()));
        }

        // Load the script into a string
        let script = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => return Err(ScriptError::ScriptLoadError(e))
        };

        let cmds = parse_script(&script)?;

        Ok(ScriptInterpreter {
            _script_path: path,
            cmds
        })
    }

    /// Create a new interpreter from the text of a script.
    pub fn from_source(script: &str) -> Result<Self, ScriptError> {
        Ok(ScriptInterpreter {
            _script_path: PathBuf::new(),
            cmds: parse_script(script)?
        })
    }

    /// Return the TCs which are due at the current session time.
    pub fn get_pending_tcs(&mut self) -> PendingTcs {
        self.get_pending_tcs_at(get_elapsed_seconds())
    }

    /// Return the TCs which are due at the given script time.
    pub fn get_pending_tcs_at(&mut self, current_time_s: f64) -> PendingTcs {

        // If the queue is empty the script is over and we return the end of
        // script variant
        if self.cmds.is_empty() {
            return PendingTcs::EndOfScript
        }

        let mut tc_vec: Vec<Tc> = vec![];

        // Pop TCs from the head of the queue until the exec times are larger
        // than the current time.
        while let Some(cmd) = self.cmds.front() {
            if cmd.exec_time_s >= current_time_s {
                break;
            }
            tc_vec.push(cmd.tc);
            self.cmds.pop_front();
        }

        // If the vector is longer than 0 return Some, otherwise None
        if tc_vec.len() > 0 {
            PendingTcs::Some(tc_vec)
        }
        else {
            PendingTcs::None
        }
    }

    /// Get the number of TCs in the script
    pub fn get_num_tcs(&self) -> usize {
        self.cmds.len()
    }

    /// Get the length of the script in seconds
    pub fn get_duration(&self) -> f64 {
        match self.cmds.back() {
            Some(c) => c.exec_time_s,
            None => 0f64
        }
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn parse_script(script: &str) -> Result<VecDeque<Command>, ScriptError> {
    // Empty queue of commands
    let mut tc_queue: VecDeque<Command> = VecDeque::new();

    // Go through the script executing __the magic regex__.
    let re = match RegexBuilder::new(COMMAND_REGEX)
        .multi_line(true)
        .build()
    {
        Ok(r) => r,
        Err(e) => return Err(ScriptError::RegexError(e))
    };

    for cap in re.captures_iter(script) {
        let (time_str, tc_str) = match (cap.get(1), cap.get(3)) {
            (Some(t), Some(c)) => (t.as_str(), c.as_str()),
            _ => continue
        };

        // Parse the exec time
        let exec_time_s: f64 = match time_str.parse() {
            Ok(t) => t,
            Err(e) => return Err(
                ScriptError::InvalidTimestamp(format!("{}", e)))
        };

        // Parse the TC from the payload. The scripts contain JSON only.
        let tc = match Tc::from_json(tc_str) {
            Ok(c) => c,
            Err(e) => return Err(ScriptError::InvalidTc(
                exec_time_s, e
            ))
        };

        // Build command from the match
        tc_queue.push_back(Command {
            exec_time_s,
            tc
        });
    }

    if tc_queue.is_empty() {
        return Err(ScriptError::ScriptEmpty)
    }

    Ok(tc_queue)
}
