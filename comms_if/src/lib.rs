//! # Communications interface crate.
//!
//! Provides all common communications interfaces for the pan-tilt tracking software: the servo
//! drive wire protocol, the detection records delivered by the vision pipeline, and the operator
//! telecommands.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Operator telecommands
pub mod tc;

/// Definitions for equipment (servo drives, vision pipeline)
pub mod eqpt;
