//! # Detection Client
//!
//! The detection client reads detection batches from the vision pipeline as JSON lines, one
//! batch per processed frame, and hands each batch to a sink (normally
//! `TrackSup::set_detections`). A line is either a bare array of detections or a full
//! `DetectionBatch` object. Malformed lines are logged and skipped.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, info, warn};
use serde::Deserialize;
use std::io::BufRead;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use comms_if::eqpt::vision::{Detection, DetectionBatch};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Handle on the background thread reading the feed.
pub struct DetClient {
    handle: Option<JoinHandle<Result<FeedStats, DetectionFeedError>>>,

    finished: Arc<AtomicBool>,
}

/// Counters from one run of the feed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    /// Batches passed on to the sink
    pub num_batches: u64,

    /// Lines that could not be parsed
    pub num_bad_lines: u64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DetectionFeedError {
    #[error("Could not read from the detection feed: {0}")]
    ReadError(std::io::Error),

    #[error("Could not parse the detection batch: {0}")]
    ParseError(serde_json::Error),

    #[error("Could not spawn the detection feed thread: {0}")]
    SpawnError(std::io::Error),

    #[error("The detection feed thread panicked")]
    ThreadPanicked,
}

/// Accepted shapes of one feed line.
#[derive(Deserialize)]
#[serde(untagged)]
enum FeedLine {
    Batch(DetectionBatch),
    List(Vec<Detection>),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl DetClient {
    /// Start reading the feed on a background thread.
    pub fn spawn<R, F>(reader: R, sink: F) -> Result<Self, DetectionFeedError>
    where
        R: BufRead + Send + 'static,
        F: FnMut(Vec<Detection>) + Send + 'static,
    {
        let finished = Arc::new(AtomicBool::new(false));
        let finished_thread = finished.clone();

        let handle = thread::Builder::new()
            .name(String::from("det_client"))
            .spawn(move || {
                let result = run_feed(reader, sink);
                finished_thread.store(true, Ordering::SeqCst);
                result
            })
            .map_err(DetectionFeedError::SpawnError)?;

        Ok(Self {
            handle: Some(handle),
            finished,
        })
    }

    /// True once the feed has closed.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Wait for the feed to close.
    pub fn join(mut self) -> Result<FeedStats, DetectionFeedError> {
        match self.handle.take() {
            Some(h) => h.join().map_err(|_| DetectionFeedError::ThreadPanicked)?,
            None => Ok(FeedStats::default()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Parse one line of the feed.
pub fn parse_batch(line: &str) -> Result<DetectionBatch, DetectionFeedError> {
    match serde_json::from_str::<FeedLine>(line).map_err(DetectionFeedError::ParseError)? {
        FeedLine::Batch(b) => Ok(b),
        FeedLine::List(detections) => Ok(DetectionBatch {
            timestamp: None,
            detections,
        }),
    }
}

/// Read the feed until it closes.
fn run_feed<R, F>(reader: R, mut sink: F) -> Result<FeedStats, DetectionFeedError>
where
    R: BufRead,
    F: FnMut(Vec<Detection>),
{
    let mut stats = FeedStats::default();

    info!("Detection feed started");

    for line in reader.lines() {
        let line = line.map_err(DetectionFeedError::ReadError)?;
        let line = line.trim();

        if line.is_empty() {
            continue;
        }

        match parse_batch(line) {
            Ok(batch) => {
                debug!("Got {} detections", batch.detections.len());
                stats.num_batches += 1;
                sink(batch.detections);
            }
            Err(e) => {
                stats.num_bad_lines += 1;
                warn!("Skipping detection line: {}", e);
            }
        }
    }

    info!(
        "Detection feed closed after {} batches ({} bad lines)",
        stats.num_batches, stats.num_bad_lines
    );

    Ok(stats)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
