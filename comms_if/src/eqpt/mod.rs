//! # Equipment Interface
//!
//! This module defines the interface structures exchanged with equipment: the Modbus RTU servo
//! drives and the vision pipeline.

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

pub mod modbus;
pub mod servo;
pub mod vision;
