//! # Servo interface module
//!
//! The servo interface owns the Modbus RTU connection to the two servo drives of the rig and
//! provides register level access to them. It contains no control logic.
//!
//! All bus transactions are serialised by a single bus lock which is held only for the duration
//! of one request/response pair. The connection state, the failure counters and the motion
//! inhibit are atomics so they can be read from any thread without touching the bus.
//!
//! Once the emergency stop has fired the transport latches a motion inhibit, after which any
//! nonzero write to the speed register is refused. The check is made with the bus lock held, so no
//! motion command can reach a drive after the emergency zero speed write.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod link;
mod params;

#[cfg(test)]
pub(crate) mod mock;

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use link::*;
pub use params::*;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
    Mutex,
};
use thiserror::Error;

// Internal
use comms_if::eqpt::{
    modbus::to_modbus_16bit,
    servo::{SlaveIds, REG_RUN_STOP, REG_SPEED, RUN, STOP},
};
use crate::{
    events::{EventBus, TrackEvent},
    lock,
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Register level access to the servo drives.
pub struct ServoTransport {
    params: SerialParams,

    slaves: SlaveIds,

    /// The open link, guarded by the bus lock
    link: Mutex<Option<Box<dyn ModbusLink>>>,

    state: AtomicU8,

    inhibit: AtomicBool,

    consec_write_failures: AtomicU32,

    total_write_failures: AtomicU64,

    events: EventBus,
}

/// A failed register transaction.
#[derive(Debug, Error)]
#[error("Transaction on register {address} of slave {slave_id} failed: {cause}")]
pub struct WriteError {
    pub slave_id: u8,
    pub address: u16,
    pub cause: WriteFailure,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

#[derive(Debug, Error)]
pub enum WriteFailure {
    #[error("the transport is not connected")]
    NotConnected,

    #[error("motion is inhibited by the emergency stop")]
    Inhibited,

    #[error("{0}")]
    Link(LinkError),
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("The servo link is unavailable: {0}")]
    LinkUnavailable(LinkError),

    #[error("Slave {slave_id} did not answer the round trip check: {cause}")]
    ProtocolTestFailed { slave_id: u8, cause: WriteFailure },

    #[error("Could not start the drives")]
    MotorStartFailed,

    #[error("Could not stop the drives before disconnecting")]
    StopFailed,

    #[error("Another connection attempt is in progress")]
    ConnectInProgress,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ServoTransport {
    /// Create a new disconnected transport.
    pub fn new(params: SerialParams, events: EventBus) -> Self {
        Self {
            slaves: params.slaves(),
            params,
            link: Mutex::new(None),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            inhibit: AtomicBool::new(false),
            consec_write_failures: AtomicU32::new(0),
            total_write_failures: AtomicU64::new(0),
            events,
        }
    }

    /// Open the serial port and start both drives.
    pub fn connect(&self) -> Result<(), ConnError> {
        info!(
            "Connecting to the servo drives on {} ({} baud, {}{}{})",
            self.params.port,
            self.params.baud,
            self.params.data_bits,
            match self.params.parity {
                Parity::None => 'N',
                Parity::Even => 'E',
                Parity::Odd => 'O',
            },
            self.params.stop_bits
        );

        self.connect_using(|| {
            SerialLink::open(&self.params).map(|l| Box::new(l) as Box<dyn ModbusLink>)
        })
    }

    /// Connect over an already opened link.
    pub fn connect_with_link(&self, link: Box<dyn ModbusLink>) -> Result<(), ConnError> {
        self.connect_using(move || Ok(link))
    }

    /// Stop both drives and close the link.
    ///
    /// The transport is always left disconnected, even if the stop writes fail.
    pub fn disconnect(&self) -> Result<(), ConnError> {
        if self.state() == ConnectionState::Disconnected {
            debug!("Servo transport already disconnected");
            return Ok(());
        }

        info!("Disconnecting from the servo drives");

        let mut stopped = true;
        for &(address, value) in [(REG_SPEED, 0), (REG_RUN_STOP, STOP)].iter() {
            for (axis, slave_id) in self.slaves.both().iter() {
                if let Err(e) = self.write_inner(*slave_id, address, value, false) {
                    warn!("Could not stop the {} drive: {}", axis, e);
                    stopped = false;
                }
            }
        }

        self.close_link();
        self.set_state(ConnectionState::Disconnected);
        self.events.emit(TrackEvent::ConnectionChanged(false));

        info!("Servo transport disconnected");

        match stopped {
            true => Ok(()),
            false => Err(ConnError::StopFailed),
        }
    }

    /// Write a signed value into a holding register.
    ///
    /// A failed write is not a transport fault on its own, but too many consecutive failures will
    /// drop the connection.
    pub fn write_register(&self, slave_id: u8, address: u16, value: i16) -> Result<(), WriteError> {
        self.write_inner(slave_id, address, value, true)
    }

    /// Read a holding register.
    pub fn read_register(&self, slave_id: u8, address: u16) -> Result<u16, WriteError> {
        let mut link = lock(&self.link);

        let result = match link.as_mut() {
            Some(l) => l
                .read_holding_register(slave_id, address)
                .map_err(WriteFailure::Link),
            None => Err(WriteFailure::NotConnected),
        };

        result.map_err(|cause| WriteError {
            slave_id,
            address,
            cause,
        })
    }

    /// Set the run/stop register of both drives, returning `true` if both accepted it.
    pub fn set_run_state(&self, run: bool) -> bool {
        let value = if run { RUN } else { STOP };

        let mut ok = true;
        for (axis, slave_id) in self.slaves.both().iter() {
            if let Err(e) = self.write_register(*slave_id, REG_RUN_STOP, value) {
                error!("Could not set the run state of the {} drive: {}", axis, e);
                ok = false;
            }
        }

        ok
    }

    /// Refuse all further nonzero speed writes.
    ///
    /// This cannot be undone.
    pub fn inhibit_motion(&self) {
        self.inhibit.store(true, Ordering::SeqCst);
    }

    pub fn is_inhibited(&self) -> bool {
        self.inhibit.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::SeqCst) {
            2 => ConnectionState::Connected,
            1 => ConnectionState::Connecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn slaves(&self) -> SlaveIds {
        self.slaves
    }

    pub fn consec_write_failures(&self) -> u32 {
        self.consec_write_failures.load(Ordering::Relaxed)
    }

    pub fn total_write_failures(&self) -> u64 {
        self.total_write_failures.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn connect_using<F>(&self, open: F) -> Result<(), ConnError>
    where
        F: FnOnce() -> Result<Box<dyn ModbusLink>, LinkError>,
    {
        // Only one attempt at a time, and connecting twice is fine
        if let Err(current) = self.state.compare_exchange(
            ConnectionState::Disconnected as u8,
            ConnectionState::Connecting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return match current {
                c if c == ConnectionState::Connected as u8 => {
                    info!("Servo transport already connected");
                    Ok(())
                }
                _ => Err(ConnError::ConnectInProgress),
            };
        }

        let link = match open() {
            Ok(l) => l,
            Err(e) => {
                error!("Could not open the servo link: {}", e);
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnError::LinkUnavailable(e));
            }
        };

        *lock(&self.link) = Some(link);
        self.consec_write_failures.store(0, Ordering::Relaxed);

        // Round trip check on each slave
        for (axis, slave_id) in self.slaves.both().iter() {
            match self.read_register(*slave_id, REG_RUN_STOP) {
                Ok(v) => debug!("{} drive (slave {}) run state: {}", axis, slave_id, v),
                Err(e) => {
                    error!("{} drive (slave {}) did not respond: {}", axis, slave_id, e);
                    self.close_link();
                    self.set_state(ConnectionState::Disconnected);
                    return Err(ConnError::ProtocolTestFailed {
                        slave_id: *slave_id,
                        cause: e.cause,
                    });
                }
            }
        }

        // Start the drives
        let mut started = true;
        for (axis, slave_id) in self.slaves.both().iter() {
            if let Err(e) = self.write_inner(*slave_id, REG_RUN_STOP, RUN, false) {
                error!("Could not start the {} drive: {}", axis, e);
                started = false;
            }
        }

        if !started {
            self.close_link();
            self.set_state(ConnectionState::Disconnected);
            return Err(ConnError::MotorStartFailed);
        }

        self.set_state(ConnectionState::Connected);
        self.events.emit(TrackEvent::ConnectionChanged(true));

        info!("Servo drives connected and started");

        Ok(())
    }

    fn write_inner(
        &self,
        slave_id: u8,
        address: u16,
        value: i16,
        require_connected: bool,
    ) -> Result<(), WriteError> {
        let err = |cause| WriteError {
            slave_id,
            address,
            cause,
        };

        if require_connected && !self.is_connected() {
            return Err(err(WriteFailure::NotConnected));
        }

        // Bus critical section
        let result = {
            let mut link = lock(&self.link);

            if address == REG_SPEED && value != 0 && self.is_inhibited() {
                return Err(err(WriteFailure::Inhibited));
            }

            match link.as_mut() {
                Some(l) => l.write_single_register(slave_id, address, to_modbus_16bit(value)),
                None => return Err(err(WriteFailure::NotConnected)),
            }
        };

        match result {
            Ok(()) => {
                self.consec_write_failures.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.total_write_failures.fetch_add(1, Ordering::Relaxed);
                let consec = self.consec_write_failures.fetch_add(1, Ordering::Relaxed) + 1;

                if consec >= self.params.max_consec_write_failures {
                    self.escalate(consec);
                }

                Err(err(WriteFailure::Link(e)))
            }
        }
    }

    /// Drop the connection after too many consecutive write failures.
    fn escalate(&self, consec: u32) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Disconnected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        error!(
            "{} consecutive servo writes failed, the servo link is considered lost",
            consec
        );

        self.close_link();
        self.events.emit(TrackEvent::ConnectionChanged(false));
    }

    fn close_link(&self) {
        if let Some(mut l) = lock(&self.link).take() {
            l.close();
        }
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::mock::MockLink;
    use super::*;

    fn transport() -> (ServoTransport, MockLink) {
        (
            ServoTransport::new(SerialParams::default(), EventBus::new()),
            MockLink::new(),
        )
    }

    #[test]
    fn test_connect_starts_drives() {
        let (t, mock) = transport();
        let events = t.events.subscribe();

        assert_eq!(t.state(), ConnectionState::Disconnected);
        t.connect_with_link(mock.boxed()).unwrap();

        assert!(t.is_connected());
        assert_eq!(mock.register(1, REG_RUN_STOP), Some(RUN));
        assert_eq!(mock.register(10, REG_RUN_STOP), Some(RUN));
        assert_eq!(events.try_recv(), Ok(TrackEvent::ConnectionChanged(true)));

        // Connecting again is a no-op
        let writes = mock.num_writes();
        t.connect_with_link(MockLink::new().boxed()).unwrap();
        assert_eq!(mock.num_writes(), writes);
    }

    #[test]
    fn test_connect_failures() {
        let (t, mock) = transport();
        mock.set_fail_reads(true);

        assert!(matches!(
            t.connect_with_link(mock.boxed()),
            Err(ConnError::ProtocolTestFailed {
                slave_id: 1,
                cause: WriteFailure::Link(_)
            })
        ));
        assert_eq!(t.state(), ConnectionState::Disconnected);
        assert!(mock.is_closed());

        let (t, mock) = transport();
        mock.set_fail_writes(true);

        assert!(matches!(
            t.connect_with_link(mock.boxed()),
            Err(ConnError::MotorStartFailed)
        ));
        assert_eq!(t.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_write_encoding() {
        let (t, mock) = transport();

        assert!(matches!(
            t.write_register(1, REG_SPEED, -5),
            Err(WriteError {
                cause: WriteFailure::NotConnected,
                ..
            })
        ));

        t.connect_with_link(mock.boxed()).unwrap();
        t.write_register(1, REG_SPEED, -5).unwrap();

        let raw = mock.bus.lock().unwrap().writes.last().copied();
        assert_eq!(raw, Some((1, REG_SPEED, 65531)));
    }

    #[test]
    fn test_read_register() {
        let (t, mock) = transport();

        assert!(matches!(
            t.read_register(1, REG_RUN_STOP),
            Err(WriteError {
                slave_id: 1,
                cause: WriteFailure::NotConnected,
                ..
            })
        ));

        t.connect_with_link(mock.boxed()).unwrap();
        assert_eq!(t.read_register(1, REG_RUN_STOP).unwrap(), RUN as u16);
        t.write_register(10, REG_SPEED, -5).unwrap();
        assert_eq!(t.read_register(10, REG_SPEED).unwrap(), 65531);

        // Failed reads are not counted as write failures
        mock.set_fail_reads(true);
        assert!(matches!(
            t.read_register(10, REG_SPEED),
            Err(WriteError {
                address: REG_SPEED,
                cause: WriteFailure::Link(_),
                ..
            })
        ));
        assert_eq!(t.consec_write_failures(), 0);
        assert!(t.is_connected());
    }

    #[test]
    fn test_failure_escalation() {
        let (t, mock) = transport();
        t.connect_with_link(mock.boxed()).unwrap();
        let events = t.events.subscribe();

        mock.set_fail_writes(true);
        for _ in 0..5 {
            assert!(t.write_register(1, REG_SPEED, 3).is_err());
        }
        assert!(t.is_connected());
        assert_eq!(t.consec_write_failures(), 5);

        // A success resets the run of failures
        mock.set_fail_writes(false);
        t.write_register(1, REG_SPEED, 3).unwrap();
        assert_eq!(t.consec_write_failures(), 0);

        mock.set_fail_writes(true);
        for _ in 0..6 {
            assert!(t.write_register(10, REG_SPEED, 3).is_err());
        }
        assert_eq!(t.state(), ConnectionState::Disconnected);
        assert_eq!(t.total_write_failures(), 11);
        assert!(mock.is_closed());
        assert_eq!(events.try_recv(), Ok(TrackEvent::ConnectionChanged(false)));
    }

    #[test]
    fn test_motion_inhibit() {
        let (t, mock) = transport();
        t.connect_with_link(mock.boxed()).unwrap();

        t.inhibit_motion();

        assert!(matches!(
            t.write_register(1, REG_SPEED, 4),
            Err(WriteError {
                cause: WriteFailure::Inhibited,
                ..
            })
        ));
        assert!(t.write_register(1, REG_SPEED, 0).is_ok());
        assert!(t.set_run_state(false));

        // Refused writes are not link failures
        assert_eq!(t.consec_write_failures(), 0);
        assert_eq!(mock.speed_writes(1), vec![0]);
    }

    #[test]
    fn test_disconnect() {
        let (t, mock) = transport();
        t.connect_with_link(mock.boxed()).unwrap();
        t.write_register(10, REG_SPEED, 7).unwrap();

        t.disconnect().unwrap();

        assert_eq!(t.state(), ConnectionState::Disconnected);
        assert_eq!(mock.register(10, REG_SPEED), Some(0));
        assert_eq!(mock.register(1, REG_RUN_STOP), Some(STOP));
        assert_eq!(mock.register(10, REG_RUN_STOP), Some(STOP));
        assert!(mock.is_closed());

        // Failing stop writes still leave the transport disconnected
        let (t, mock) = transport();
        t.connect_with_link(mock.boxed()).unwrap();
        mock.set_fail_writes(true);

        assert!(matches!(t.disconnect(), Err(ConnError::StopFailed)));
        assert_eq!(t.state(), ConnectionState::Disconnected);
        assert_eq!(mock.write_attempts(), 2 + 4);
    }
}
