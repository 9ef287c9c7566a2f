//! # Tracking supervisor module
//!
//! The supervisor owns the tracking session. It runs the control loop on a background thread at a
//! fixed cadence, independent of the rate detections arrive at, and provides the operator surface
//! (connect, start, stop, emergency stop, status).
//!
//! # Concurrency
//!
//! - Detections, the target lock and the controller share a single mutex. The control loop holds
//!   it only while selecting the target and computing the command, never while talking to the
//!   drives.
//! - The tracking state and the session counter are atomics. Each control loop belongs to one
//!   session and exits as soon as the counter moves on, so stopping never needs a lock.
//! - The emergency stop goes straight to the driver's lock free path, then latches the
//!   `EmergencyStopped` state. Only a restart leaves that state.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod params;

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use params::*;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    mpsc::{channel, Receiver, RecvTimeoutError},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::Instant;

// Internal
use comms_if::eqpt::vision::{Detection, TrackId};
use crate::{
    events::{EventBus, TrackEvent},
    ibvs_ctrl::{ErrorStats, IbvsCtrl},
    lock,
    params::TrackExecParams,
    servo_drv::ServoDriver,
    servo_if::{ModbusLink, ServoTransport},
    target_sel::{Selection, TargetSelector},
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

pub struct TrackSup {
    shared: Arc<Shared>,

    worker: Mutex<Option<Worker>>,
}

/// Snapshot of the whole tracking system.
#[derive(Debug, Clone, Serialize)]
pub struct TrackStatus {
    pub connected: bool,

    pub tracking: bool,

    pub state: TrackingState,

    /// Locked track, `None` when following the largest balloon
    pub target_id: Option<TrackId>,

    /// Units: RPM
    pub pan_speed: i32,

    /// Units: RPM
    pub tilt_speed: i32,

    /// Units: seconds
    pub last_movement_age_s: f64,

    pub error_stats: Option<ErrorStats>,

    /// Consecutive ticks the locked track has been missing
    pub lost_count: u32,

    pub consec_write_failures: u32,

    pub total_write_failures: u64,
}

/// State shared between the operator side and the control loop.
struct Shared {
    params: TrackSupParams,

    /// Units: RPM
    min_speed_rpm: i32,

    driver: ServoDriver,

    state: AtomicU8,

    /// Incremented to end the running control loop
    session: AtomicU64,

    data: Mutex<TrackData>,

    events: EventBus,
}

struct TrackData {
    detections: Vec<Detection>,
    selector: TargetSelector,
    ctrl: IbvsCtrl,
}

/// Handle on a running control loop.
struct Worker {
    handle: JoinHandle<()>,

    /// Disconnects when the loop has finished
    done_rx: Receiver<()>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum TrackingState {
    Idle = 0,
    Tracking = 1,
    EmergencyStopped = 2,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl TrackSup {
    /// Build the whole tracking chain from the parameters. The transport starts disconnected.
    pub fn new(params: &TrackExecParams) -> Self {
        let events = EventBus::new();
        let transport = Arc::new(ServoTransport::new(params.serial.clone(), events.clone()));
        let driver = ServoDriver::new(params.servo.clone(), transport, events.clone());

        let data = TrackData {
            detections: Vec::new(),
            selector: TargetSelector::new(params.target_sel.clone()),
            ctrl: IbvsCtrl::new(params),
        };

        Self {
            shared: Arc::new(Shared {
                params: params.track_sup.clone(),
                min_speed_rpm: params.servo.min_speed_rpm,
                driver,
                state: AtomicU8::new(TrackingState::Idle as u8),
                session: AtomicU64::new(0),
                data: Mutex::new(data),
                events,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Connect to the servo drives over the configured serial port.
    pub fn connect(&self) -> bool {
        match self.shared.driver.transport().connect() {
            Ok(()) => true,
            Err(e) => {
                error!("Could not connect to the servo drives: {}", e);
                false
            }
        }
    }

    /// Connect to the servo drives over an already open link.
    pub fn connect_with_link(&self, link: Box<dyn ModbusLink>) -> bool {
        match self.shared.driver.transport().connect_with_link(link) {
            Ok(()) => true,
            Err(e) => {
                error!("Could not connect to the servo drives: {}", e);
                false
            }
        }
    }

    /// Stop tracking, stop the drives and close the link.
    pub fn disconnect(&self) -> bool {
        self.stop();

        match self.shared.driver.transport().disconnect() {
            Ok(()) => true,
            Err(e) => {
                error!("Error while disconnecting: {}", e);
                false
            }
        }
    }

    /// Start tracking the given track, or the largest balloon if `None`.
    ///
    /// Refused after an emergency stop.
    pub fn start(&self, target_id: Option<TrackId>) -> bool {
        if self.state() == TrackingState::EmergencyStopped {
            warn!("Cannot start tracking after an emergency stop");
            return false;
        }

        let mut worker = lock(&self.worker);

        if let Some(w) = worker.take() {
            info!("Restarting tracking");
            self.shutdown(w);
        }

        {
            let mut data = lock(&self.shared.data);
            data.ctrl.reset();
            data.selector.reset();
            data.selector.update_tracking_target(target_id);
        }

        if self
            .shared
            .state
            .compare_exchange(
                TrackingState::Idle as u8,
                TrackingState::Tracking as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            warn!("Tracking could not be started, an emergency stop is in effect");
            return false;
        }

        if !self.shared.driver.transport().is_connected() {
            warn!("Tracking started while the servo drives are disconnected");
        }

        let session = self.shared.session.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = self.shared.clone();
        let (done_tx, done_rx) = channel::<()>();

        let spawn_result = thread::Builder::new()
            .name(String::from("track_ctrl"))
            .spawn(move || {
                control_loop(shared, session);
                drop(done_tx);
            });

        match spawn_result {
            Ok(handle) => {
                *worker = Some(Worker { handle, done_rx });
                match target_id {
                    Some(id) => info!("Tracking started on track {}", id),
                    None => info!("Tracking started on the largest balloon"),
                }
                true
            }
            Err(e) => {
                error!("Could not spawn the control loop: {}", e);
                self.shared.set_idle();
                false
            }
        }
    }

    /// Stop tracking and bring the rig to rest.
    ///
    /// Returns `false` if the control loop did not exit within the join timeout. The state is
    /// `Idle` either way and the loop stops the drives once it does exit.
    pub fn stop(&self) -> bool {
        let worker = lock(&self.worker).take();

        match worker {
            Some(w) => {
                let joined = self.shutdown(w);
                info!("Tracking stopped");
                joined
            }
            None => {
                debug!("Tracking already stopped");
                true
            }
        }
    }

    /// Stop both drives immediately and latch the emergency stopped state.
    ///
    /// Returns `false` if either axis could not be confirmed stopped.
    pub fn emergency_stop(&self) -> bool {
        let ok = self.shared.driver.emergency_stop();

        self.shared
            .state
            .store(TrackingState::EmergencyStopped as u8, Ordering::SeqCst);
        self.shared.session.fetch_add(1, Ordering::SeqCst);

        self.shared.events.emit(TrackEvent::EmergencyStopped);

        ok
    }

    /// Replace the detections with the latest batch.
    pub fn set_detections(&self, detections: Vec<Detection>) {
        lock(&self.shared.data).detections = detections;
    }

    /// Change the locked track while tracking.
    pub fn update_tracking_target(&self, target_id: Option<TrackId>) {
        lock(&self.shared.data)
            .selector
            .update_tracking_target(target_id);
    }

    /// Move the principal point to the centre of a frame of the given size.
    pub fn set_frame_center(&self, width: u32, height: u32) {
        lock(&self.shared.data).ctrl.set_frame_center(width, height);
    }

    pub fn state(&self) -> TrackingState {
        self.shared.state()
    }

    pub fn status(&self) -> TrackStatus {
        let drv = self.shared.driver.status();
        let state = self.state();

        let (target_id, error_stats, lost_count) = {
            let data = lock(&self.shared.data);
            (
                data.selector.locked_track_id(),
                data.ctrl.error_stats(),
                data.selector.lost_count(),
            )
        };

        TrackStatus {
            connected: drv.connected,
            tracking: state == TrackingState::Tracking,
            state,
            target_id,
            pan_speed: drv.pan_speed,
            tilt_speed: drv.tilt_speed,
            last_movement_age_s: drv.last_movement_age_s,
            error_stats,
            lost_count,
            consec_write_failures: drv.consec_write_failures,
            total_write_failures: drv.total_write_failures,
        }
    }

    /// Register for tracking events.
    pub fn subscribe(&self) -> Receiver<TrackEvent> {
        self.shared.events.subscribe()
    }

    pub fn driver(&self) -> &ServoDriver {
        &self.shared.driver
    }

    /// End the worker's session and wait a bounded time for it to exit.
    ///
    /// Returns `false` if the loop is still running after the join timeout or panicked.
    fn shutdown(&self, worker: Worker) -> bool {
        self.shared.set_idle();
        self.shared.session.fetch_add(1, Ordering::SeqCst);

        match worker
            .done_rx
            .recv_timeout(self.shared.params.stop_join_timeout())
        {
            // Still inside a bus transaction, it stops the drives when it gets out
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Control loop did not exit within {:.1} s, continuing without it",
                    self.shared.params.stop_join_timeout_s
                );
                false
            }
            _ => match worker.handle.join() {
                Ok(()) => true,
                Err(_) => {
                    error!("Control loop panicked");
                    if self.state() != TrackingState::EmergencyStopped {
                        self.shared.driver.stop_movement();
                    }
                    false
                }
            },
        }
    }
}

impl Drop for TrackSup {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn state(&self) -> TrackingState {
        match self.state.load(Ordering::SeqCst) {
            2 => TrackingState::EmergencyStopped,
            1 => TrackingState::Tracking,
            _ => TrackingState::Idle,
        }
    }

    /// Tracking -> Idle, leaving an emergency stop in place.
    fn set_idle(&self) {
        self.state
            .compare_exchange(
                TrackingState::Tracking as u8,
                TrackingState::Idle as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok();
    }

    fn should_run(&self, session: u64) -> bool {
        self.session.load(Ordering::SeqCst) == session && self.state() == TrackingState::Tracking
    }

    /// One control tick.
    fn tick(&self, session: u64) {
        let (selection, locked_id, output, (cx, cy)) = {
            let mut data = lock(&self.data);
            let TrackData {
                detections,
                selector,
                ctrl,
            } = &mut *data;

            let selection = selector.select_detailed(detections);
            let output = selection
                .target()
                .map(|t| ctrl.compute(t.center_x, t.center_y));

            (
                selection,
                selector.locked_track_id(),
                output,
                ctrl.principal_point(),
            )
        };

        // Stopped while computing
        if !self.should_run(session) {
            return;
        }

        if let Selection::Fallback {
            target,
            switched: true,
        } = selection
        {
            self.events.emit(TrackEvent::TargetSwitched {
                from: locked_id,
                to: target.track_id,
            });
        }

        let (target, output) = match (selection.target(), output) {
            (Some(t), Some(o)) => (t, o),
            _ => {
                // Hold still until a target is found
                self.driver.stop_movement();
                return;
            }
        };

        // Gate on the unrounded demand, a damped 0.6 RPM is a stop
        let min = self.min_speed_rpm as f64;
        if output.pan_demand_rpm.abs() >= min || output.tilt_demand_rpm.abs() >= min {
            self.driver
                .move_to_speeds(output.pan_demand_rpm, output.tilt_demand_rpm);
        } else {
            self.driver.stop_movement();
        }

        if output.target_reached {
            debug!("Target reached, inside the deadzone");
            self.events.emit(TrackEvent::TargetReached);
        }

        self.events.emit(TrackEvent::TrackingUpdate {
            target_x: target.center_x,
            target_y: target.center_y,
            cx,
            cy,
        });
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Fixed cadence control loop, running until its session ends.
fn control_loop(shared: Arc<Shared>, session: u64) {
    info!("Control loop started (session {})", session);

    let period = shared.params.control_period();
    let mut cycle_start = Instant::now();

    loop {
        // Sleep out the rest of the period
        let cycle_dur = cycle_start.elapsed();
        match period.checked_sub(cycle_dur) {
            Some(d) => thread::sleep(d),
            None => warn!(
                "Control cycle overran by {:.06} s",
                cycle_dur.as_secs_f64() - period.as_secs_f64()
            ),
        }
        cycle_start = Instant::now();

        if !shared.should_run(session) {
            break;
        }

        shared.tick(session);
    }

    // Leave the rig at rest, the emergency stop has already zeroed it
    if shared.state() != TrackingState::EmergencyStopped {
        shared.driver.stop_movement();
    }

    info!("Control loop ended (session {})", session);
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::servo_if::mock::MockLink;
    use comms_if::eqpt::servo::{ServoCommand, REG_SPEED};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(3);

    fn params() -> TrackExecParams {
        let mut p = TrackExecParams::default();
        p.track_sup.control_period_s = 0.01;
        p.servo.speed_smoothing = 1.0;
        p
    }

    fn connected_sup(p: &TrackExecParams) -> (TrackSup, MockLink) {
        let sup = TrackSup::new(p);
        let mock = MockLink::new();
        assert!(sup.connect_with_link(mock.boxed()));
        (sup, mock)
    }

    /// Wait for an event matching the predicate.
    fn wait_for<F: Fn(&TrackEvent) -> bool>(rx: &Receiver<TrackEvent>, pred: F) -> bool {
        let deadline = Instant::now() + WAIT;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(remaining) {
                Ok(e) if pred(&e) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
        false
    }

    fn det(x: f64, y: f64, w: f64, h: f64, id: Option<TrackId>) -> Detection {
        Detection::new(x, y, w, h, 0.9, id)
    }

    #[test]
    fn test_far_target_scenario() {
        let (sup, mock) = connected_sup(&params());
        let events = sup.subscribe();

        sup.set_detections(vec![det(100.0, 100.0, 20.0, 20.0, Some(1))]);
        assert!(sup.start(Some(1)));
        assert_eq!(sup.state(), TrackingState::Tracking);

        assert!(wait_for(&events, |e| *e
            == TrackEvent::TrackingUpdate {
                target_x: 110.0,
                target_y: 110.0,
                cx: 320.0,
                cy: 240.0
            }));
        assert!(wait_for(&events, |e| *e
            == TrackEvent::CommandSent { pan: 10, tilt: -10 }));

        // Both axes move, inverted by the mounting, never above the limit
        assert!(mock.speed_writes(1).contains(&-10));
        assert!(mock.speed_writes(10).contains(&10));

        assert!(sup.stop());
        assert_eq!(sup.state(), TrackingState::Idle);
        assert_eq!(sup.driver().speeds(), ServoCommand::ZERO);
        assert_eq!(mock.register(1, REG_SPEED), Some(0));

        let status = sup.status();
        assert!(status.connected);
        assert!(!status.tracking);
        assert_eq!(status.target_id, Some(1));
        assert!(status.error_stats.is_some());
    }

    #[test]
    fn test_target_in_deadzone_scenario() {
        let (sup, mock) = connected_sup(&params());
        let events = sup.subscribe();

        // Centre at (325, 243)
        sup.set_detections(vec![det(315.0, 233.0, 20.0, 20.0, Some(4))]);
        assert!(sup.start(None));

        assert!(wait_for(&events, |e| *e == TrackEvent::TargetReached));
        sup.stop();

        assert!(mock.speed_writes(1).iter().all(|v| *v == 0));
        assert!(mock.speed_writes(10).iter().all(|v| *v == 0));
    }

    #[test]
    fn test_holds_without_target() {
        let (sup, mock) = connected_sup(&params());

        assert!(sup.start(None));
        thread::sleep(Duration::from_millis(100));
        sup.stop();

        assert!(!mock.speed_writes(1).is_empty());
        assert!(mock.speed_writes(1).iter().all(|v| *v == 0));
    }

    #[test]
    fn test_target_switched_event() {
        let mut p = params();
        p.target_sel.max_lost_frames = 2;
        let (sup, _mock) = connected_sup(&p);
        let events = sup.subscribe();

        sup.set_detections(vec![
            det(0.0, 0.0, 10.0, 10.0, Some(1)),
            det(300.0, 200.0, 40.0, 40.0, Some(2)),
        ]);
        assert!(sup.start(Some(5)));

        assert!(wait_for(&events, |e| *e
            == TrackEvent::TargetSwitched {
                from: Some(5),
                to: Some(2)
            }));
        sup.stop();
    }

    #[test]
    fn test_emergency_stop() {
        let (sup, mock) = connected_sup(&params());
        let events = sup.subscribe();

        sup.set_detections(vec![det(0.0, 0.0, 20.0, 20.0, None)]);
        assert!(sup.start(None));
        assert!(wait_for(&events, |e| matches!(e, TrackEvent::CommandSent { .. })));

        assert!(sup.emergency_stop());
        assert_eq!(sup.state(), TrackingState::EmergencyStopped);
        assert!(wait_for(&events, |e| *e == TrackEvent::EmergencyStopped));

        // Nothing moves afterwards, and tracking cannot be restarted
        thread::sleep(Duration::from_millis(50));
        assert!(!sup.start(None));
        assert_eq!(sup.driver().speeds(), ServoCommand::ZERO);
        assert_eq!(mock.register(1, REG_SPEED), Some(0));
        assert_eq!(mock.register(10, REG_SPEED), Some(0));

        sup.stop();
        assert_eq!(sup.state(), TrackingState::EmergencyStopped);
    }

    #[test]
    fn test_emergency_stop_with_failed_writes() {
        let (sup, mock) = connected_sup(&params());

        sup.set_detections(vec![det(0.0, 0.0, 20.0, 20.0, None)]);
        assert!(sup.start(None));
        thread::sleep(Duration::from_millis(50));

        mock.set_fail_writes(true);
        assert!(!sup.emergency_stop());
        assert_eq!(sup.driver().speeds(), ServoCommand::ZERO);
        assert_eq!(sup.status().state, TrackingState::EmergencyStopped);
    }

    #[test]
    fn test_stop_with_hung_write() {
        let mut p = params();
        p.track_sup.stop_join_timeout_s = 0.2;
        let (sup, mock) = connected_sup(&p);
        let events = sup.subscribe();

        sup.set_detections(vec![det(100.0, 100.0, 20.0, 20.0, Some(1))]);
        assert!(sup.start(Some(1)));
        assert!(wait_for(&events, |e| matches!(e, TrackEvent::CommandSent { .. })));

        // The next speed write hangs for longer than the join timeout
        mock.block_next_write(Duration::from_secs(1));
        thread::sleep(Duration::from_millis(50));

        let stop_start = Instant::now();
        assert!(!sup.stop());
        assert!(stop_start.elapsed() < Duration::from_millis(800));
        assert_eq!(sup.state(), TrackingState::Idle);

        // Once the write completes the loop exits and brings the rig to rest
        thread::sleep(Duration::from_millis(1500));
        assert_eq!(mock.register(1, REG_SPEED), Some(0));
        assert_eq!(mock.register(10, REG_SPEED), Some(0));
        assert_eq!(sup.driver().speeds(), ServoCommand::ZERO);
        assert!(sup.stop());
    }

    #[test]
    fn test_damped_demand_below_min_speed_stops() {
        let mut p = params();
        p.ibvs.tilt_k_p = 0.1;
        p.ibvs.tilt_k_i = 0.0;
        p.ibvs.tilt_k_d = 0.0;
        p.ibvs.gain_boost_factor = 1.0;
        let (sup, mock) = connected_sup(&p);

        // Centre at (339, 240), 19 px right of the principal point
        sup.set_detections(vec![det(329.0, 230.0, 20.0, 20.0, None)]);
        assert!(sup.start(None));
        thread::sleep(Duration::from_millis(200));

        // Moved at 2 RPM until damping brought the demand down to 0.6 RPM
        let writes: Vec<i16> = mock
            .speed_writes(1)
            .into_iter()
            .chain(mock.speed_writes(10))
            .collect();
        assert!(writes.iter().any(|v| v.abs() == 2));
        assert_eq!(sup.state(), TrackingState::Tracking);
        assert_eq!(mock.register(1, REG_SPEED), Some(0));
        assert_eq!(mock.register(10, REG_SPEED), Some(0));
        assert_eq!(sup.driver().speeds(), ServoCommand::ZERO);

        assert!(sup.stop());
    }

    #[test]
    fn test_restart_and_retarget() {
        let (sup, _mock) = connected_sup(&params());

        assert!(sup.start(Some(1)));
        assert!(sup.start(Some(2)));
        assert_eq!(sup.status().target_id, Some(2));

        sup.update_tracking_target(None);
        assert_eq!(sup.status().target_id, None);

        sup.set_frame_center(800, 600);
        assert!(sup.disconnect());
        assert_eq!(sup.state(), TrackingState::Idle);
        assert!(!sup.status().connected);
    }
}
