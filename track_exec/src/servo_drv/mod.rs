//! # Servo driver module
//!
//! The servo driver turns a desired (pan, tilt) speed pair into speed register writes. It owns the
//! per-axis smoothing, speed limits, minimum speed snapping and the sign conventions of the
//! physical mounting.
//!
//! Normal commands are serialised by the movement lock. The emergency stop does not take that
//! lock: it latches the transport's motion inhibit and writes zero speed directly, so it cannot be
//! held up by a command in progress. The current speeds are stored in atomics so both paths can
//! update them.

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
    atomic::{AtomicI32, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Instant;

// Internal
use comms_if::eqpt::servo::{Axis, ServoCommand, REG_SPEED};
use crate::{
    events::{EventBus, TrackEvent},
    lock,
    servo_if::ServoTransport,
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

pub struct ServoDriver {
    params: ServoParams,

    transport: Arc<ServoTransport>,

    /// Movement lock, serialising normal speed commands
    control_lock: Mutex<()>,

    pan_speed: AtomicI32,

    tilt_speed: AtomicI32,

    /// Instant the driver was created, which the last movement time is relative to
    epoch: Instant,

    /// Time of the last successful command relative to `epoch`.
    ///
    /// Units: milliseconds
    last_movement_ms: AtomicU64,

    events: EventBus,
}

/// Snapshot of the driver for status reporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DriverStatus {
    pub connected: bool,

    /// Units: RPM
    pub pan_speed: i32,

    /// Units: RPM
    pub tilt_speed: i32,

    /// Time since the last successful speed command.
    ///
    /// Units: seconds
    pub last_movement_age_s: f64,

    pub consec_write_failures: u32,

    pub total_write_failures: u64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ServoDriver {
    pub fn new(params: ServoParams, transport: Arc<ServoTransport>, events: EventBus) -> Self {
        Self {
            params,
            transport,
            control_lock: Mutex::new(()),
            pan_speed: AtomicI32::new(0),
            tilt_speed: AtomicI32::new(0),
            epoch: Instant::now(),
            last_movement_ms: AtomicU64::new(0),
            events,
        }
    }

    /// Command both axes to the given speeds in RPM.
    ///
    /// Returns `false` if the driver is disconnected or either write failed.
    pub fn move_to_speeds(&self, pan_speed: f64, tilt_speed: f64) -> bool {
        if !self.transport.is_connected() {
            return false;
        }

        if !pan_speed.is_finite() || !tilt_speed.is_finite() {
            warn!(
                "Ignoring non-finite speed demand ({}, {})",
                pan_speed, tilt_speed
            );
            return false;
        }

        let _guard = lock(&self.control_lock);

        // Smoothing towards the demand
        let alpha = self.params.speed_smoothing;
        let cmd = ServoCommand::new(
            self.smooth(self.pan_speed.load(Ordering::SeqCst), pan_speed, alpha),
            self.smooth(self.tilt_speed.load(Ordering::SeqCst), tilt_speed, alpha),
        );

        self.pan_speed.store(cmd.pan_speed_rpm, Ordering::SeqCst);
        self.tilt_speed.store(cmd.tilt_speed_rpm, Ordering::SeqCst);

        let pan_ok = self.write_speed(Axis::Pan, cmd.pan_speed_rpm);
        let tilt_ok = self.write_speed(Axis::Tilt, cmd.tilt_speed_rpm);

        // The emergency stop fired while this command was in flight
        if self.transport.is_inhibited() {
            self.pan_speed.store(0, Ordering::SeqCst);
            self.tilt_speed.store(0, Ordering::SeqCst);
        }

        if pan_ok && tilt_ok {
            if !cmd.is_zero() {
                self.events.emit(TrackEvent::CommandSent {
                    pan: cmd.pan_speed_rpm,
                    tilt: cmd.tilt_speed_rpm,
                });
            }
            self.last_movement_ms
                .store(self.epoch.elapsed().as_millis() as u64, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Smoothly bring both axes to rest.
    pub fn stop_movement(&self) -> bool {
        self.move_to_speeds(0.0, 0.0)
    }

    /// Immediately write zero speed to both axes, bypassing the movement lock and smoothing.
    ///
    /// After this call no nonzero speed can reach the drives. The recorded speeds are zeroed even
    /// if the writes fail.
    pub fn emergency_stop(&self) -> bool {
        self.transport.inhibit_motion();

        warn!("EMERGENCY STOP");

        let mut ok = true;
        for (axis, slave_id) in self.transport.slaves().both().iter() {
            if let Err(e) = self.transport.write_register(*slave_id, REG_SPEED, 0) {
                error!("Emergency stop of the {} axis failed: {}", axis, e);
                ok = false;
            }
        }

        self.pan_speed.store(0, Ordering::SeqCst);
        self.tilt_speed.store(0, Ordering::SeqCst);

        if ok {
            warn!("Emergency stop written to both axes");
        } else {
            error!("Emergency stop could not be confirmed on both axes");
        }

        ok
    }

    /// Enable both drives.
    pub fn start_motors(&self) -> bool {
        let ok = self.transport.set_run_state(true);
        if ok {
            info!("Servo drives started");
        }
        ok
    }

    /// Zero both speeds and disable both drives.
    pub fn stop_motors(&self) -> bool {
        {
            let _guard = lock(&self.control_lock);
            for axis in [Axis::Pan, Axis::Tilt].iter() {
                self.write_speed(*axis, 0);
            }
            self.pan_speed.store(0, Ordering::SeqCst);
            self.tilt_speed.store(0, Ordering::SeqCst);
        }

        let ok = self.transport.set_run_state(false);
        if ok {
            info!("Servo drives stopped");
        }
        ok
    }

    /// Current recorded speeds.
    pub fn speeds(&self) -> ServoCommand {
        ServoCommand::new(
            self.pan_speed.load(Ordering::SeqCst),
            self.tilt_speed.load(Ordering::SeqCst),
        )
    }

    pub fn transport(&self) -> &Arc<ServoTransport> {
        &self.transport
    }

    pub fn status(&self) -> DriverStatus {
        let speeds = self.speeds();
        let last_ms = self.last_movement_ms.load(Ordering::SeqCst);
        let now_ms = self.epoch.elapsed().as_millis() as u64;

        DriverStatus {
            connected: self.transport.is_connected(),
            pan_speed: speeds.pan_speed_rpm,
            tilt_speed: speeds.tilt_speed_rpm,
            last_movement_age_s: now_ms.saturating_sub(last_ms) as f64 / 1000.0,
            consec_write_failures: self.transport.consec_write_failures(),
            total_write_failures: self.transport.total_write_failures(),
        }
    }

    /// Smooth, round and limit one axis speed.
    fn smooth(&self, prev: i32, target: f64, alpha: f64) -> i32 {
        let prev = prev as f64;
        let mut speed = (prev + (target - prev) * alpha).round();

        if speed.abs() < 1.0 {
            speed = 0.0;
        }

        let max = self.params.max_speed_rpm as f64;
        speed.max(-max).min(max) as i32
    }

    /// Write the speed of one axis, applying the mounting convention and the minimum speed.
    fn write_speed(&self, axis: Axis, speed: i32) -> bool {
        let invert = match axis {
            Axis::Pan => self.params.invert_pan,
            Axis::Tilt => self.params.invert_tilt,
        };

        let mut value = if invert { -speed } else { speed };
        value = value
            .max(-self.params.max_speed_rpm)
            .min(self.params.max_speed_rpm);

        if value.abs() < self.params.min_speed_rpm {
            value = 0;
        }

        if speed != 0 {
            debug!("{} axis: {} -> {} RPM", axis, speed, value);
        }

        let slave_id = self.transport.slaves().of(axis);
        match self
            .transport
            .write_register(slave_id, REG_SPEED, value as i16)
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not command the {} axis: {}", axis, e);
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::servo_if::{mock::MockLink, SerialParams};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn driver(params: ServoParams) -> (Arc<ServoDriver>, MockLink) {
        let events = EventBus::new();
        let transport = Arc::new(ServoTransport::new(SerialParams::default(), events.clone()));
        let mock = MockLink::new();
        transport.connect_with_link(mock.boxed()).unwrap();

        (Arc::new(ServoDriver::new(params, transport, events)), mock)
    }

    fn unsmoothed() -> ServoParams {
        ServoParams {
            speed_smoothing: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_smoothing_and_inversion() {
        let (drv, mock) = driver(ServoParams::default());

        assert!(drv.move_to_speeds(10.0, -10.0));
        assert_eq!(drv.speeds(), ServoCommand::new(7, -7));
        assert_eq!(mock.speed_writes(1), vec![-7]);
        assert_eq!(mock.speed_writes(10), vec![7]);

        // 7 + (10 - 7) * 0.7 = 9.1
        assert!(drv.move_to_speeds(10.0, -10.0));
        assert_eq!(drv.speeds(), ServoCommand::new(9, -9));
    }

    #[test]
    fn test_limits() {
        let (drv, mock) = driver(ServoParams {
            min_speed_rpm: 3,
            ..unsmoothed()
        });

        assert!(drv.move_to_speeds(100.0, -250.0));
        assert_eq!(drv.speeds(), ServoCommand::new(10, -10));

        // Below the minimum speed nothing moves, but the demand is still recorded
        assert!(drv.move_to_speeds(2.0, 0.4));
        assert_eq!(drv.speeds(), ServoCommand::new(2, 0));
        assert_eq!(mock.speed_writes(1), vec![-10, 0]);
        assert_eq!(mock.speed_writes(10), vec![10, 0]);
    }

    #[test]
    fn test_randomised_clamp() {
        let (drv, mock) = driver(unsmoothed());
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..200 {
            let pan = rng.gen_range(-1.0e6..1.0e6);
            let tilt = rng.gen_range(-1.0e6..1.0e6);
            assert!(drv.move_to_speeds(pan, tilt));
            assert!(drv.speeds().max_abs() <= 10);
        }

        for slave in [1, 10].iter() {
            assert!(mock.speed_writes(*slave).iter().all(|v| v.abs() <= 10));
        }
    }

    #[test]
    fn test_command_sent_event() {
        let (drv, _mock) = driver(unsmoothed());
        let events = drv.events.subscribe();

        assert!(drv.move_to_speeds(4.0, -6.0));
        assert_eq!(
            events.try_recv(),
            Ok(TrackEvent::CommandSent { pan: 4, tilt: -6 })
        );

        // Zero commands are not reported
        assert!(drv.stop_movement());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_disconnected() {
        let transport = Arc::new(ServoTransport::new(
            SerialParams::default(),
            EventBus::new(),
        ));
        let drv = ServoDriver::new(ServoParams::default(), transport, EventBus::new());

        assert!(!drv.move_to_speeds(5.0, 5.0));
        assert_eq!(drv.speeds(), ServoCommand::ZERO);
    }

    #[test]
    fn test_emergency_stop_zeroes_on_failure() {
        let (drv, mock) = driver(unsmoothed());
        assert!(drv.move_to_speeds(8.0, 8.0));

        mock.set_fail_writes(true);
        assert!(!drv.emergency_stop());
        assert_eq!(drv.speeds(), ServoCommand::ZERO);

        // Nothing but zero may follow
        mock.set_fail_writes(false);
        assert!(!drv.move_to_speeds(8.0, 8.0));
        assert_eq!(drv.speeds(), ServoCommand::ZERO);
        assert_eq!(mock.speed_writes(1), vec![-8]);
        assert!(drv.stop_movement());
        assert_eq!(mock.speed_writes(1), vec![-8, 0]);
    }

    #[test]
    fn test_emergency_stop_ignores_movement_lock() {
        let (drv, mock) = driver(unsmoothed());
        assert!(drv.move_to_speeds(8.0, 8.0));

        let _held = drv.control_lock.lock().unwrap();

        let (tx, rx) = mpsc::channel();
        let drv_clone = drv.clone();
        thread::spawn(move || {
            tx.send(drv_clone.emergency_stop()).ok();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(true));
        assert_eq!(mock.register(1, REG_SPEED), Some(0));
        assert_eq!(mock.register(10, REG_SPEED), Some(0));
    }

    #[test]
    fn test_stop_motors() {
        let (drv, mock) = driver(unsmoothed());
        assert!(drv.move_to_speeds(5.0, 5.0));

        assert!(drv.stop_motors());
        assert_eq!(drv.speeds(), ServoCommand::ZERO);
        assert_eq!(mock.register(1, REG_SPEED), Some(0));
        assert_eq!(
            mock.register(10, comms_if::eqpt::servo::REG_RUN_STOP),
            Some(comms_if::eqpt::servo::STOP)
        );

        assert!(drv.start_motors());
        assert_eq!(
            mock.register(1, comms_if::eqpt::servo::REG_RUN_STOP),
            Some(comms_if::eqpt::servo::RUN)
        );
    }
}
