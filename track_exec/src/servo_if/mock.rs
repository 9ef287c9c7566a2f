//! In-memory link used by the tests, recording every transaction.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use comms_if::eqpt::{modbus::from_modbus_16bit, servo::REG_SPEED};

use super::{LinkError, ModbusLink};

/// Shared state of the mock bus.
#[derive(Debug, Default)]
pub struct MockBus {
    /// Successful writes as (slave, address, raw value)
    pub writes: Vec<(u8, u16, u16)>,

    /// Number of write attempts, including failed ones
    pub write_attempts: usize,

    /// Current register values
    pub registers: HashMap<(u8, u16), u16>,

    pub fail_writes: bool,
    pub fail_reads: bool,
    pub closed: bool,

    /// Delay applied to the next write only, as a slave that is slow to answer
    pub write_delay: Option<Duration>,
}

/// A link to the mock bus. Clones share the same bus.
#[derive(Debug, Clone, Default)]
pub struct MockLink {
    pub bus: Arc<Mutex<MockBus>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.bus.lock().unwrap().fail_writes = fail;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.bus.lock().unwrap().fail_reads = fail;
    }

    /// Make the next write hang for the given time before completing.
    pub fn block_next_write(&self, delay: Duration) {
        self.bus.lock().unwrap().write_delay = Some(delay);
    }

    /// Signed values written to the speed register of the slave, oldest first.
    pub fn speed_writes(&self, slave_id: u8) -> Vec<i16> {
        self.bus
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(s, a, _)| *s == slave_id && *a == REG_SPEED)
            .map(|(_, _, v)| from_modbus_16bit(*v))
            .collect()
    }

    /// Current signed value of a register.
    pub fn register(&self, slave_id: u8, address: u16) -> Option<i16> {
        self.bus
            .lock()
            .unwrap()
            .registers
            .get(&(slave_id, address))
            .map(|v| from_modbus_16bit(*v))
    }

    pub fn num_writes(&self) -> usize {
        self.bus.lock().unwrap().writes.len()
    }

    pub fn write_attempts(&self) -> usize {
        self.bus.lock().unwrap().write_attempts
    }

    pub fn is_closed(&self) -> bool {
        self.bus.lock().unwrap().closed
    }

    pub fn boxed(&self) -> Box<dyn ModbusLink> {
        Box::new(self.clone())
    }
}

impl ModbusLink for MockLink {
    fn write_single_register(
        &mut self,
        slave_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), LinkError> {
        let delay = self.bus.lock().unwrap().write_delay.take();
        if let Some(d) = delay {
            thread::sleep(d);
        }

        let mut bus = self.bus.lock().unwrap();
        bus.write_attempts += 1;

        if bus.fail_writes {
            return Err(LinkError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "no response from slave",
            )));
        }

        bus.writes.push((slave_id, address, value));
        bus.registers.insert((slave_id, address), value);
        Ok(())
    }

    fn read_holding_register(&mut self, slave_id: u8, address: u16) -> Result<u16, LinkError> {
        let bus = self.bus.lock().unwrap();

        if bus.fail_reads {
            return Err(LinkError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "no response from slave",
            )));
        }

        Ok(*bus.registers.get(&(slave_id, address)).unwrap_or(&0))
    }

    fn close(&mut self) {
        self.bus.lock().unwrap().closed = true;
    }
}
