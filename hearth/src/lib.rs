//! Wiring and lifecycle for the hearth delivery core
//!
//! Loads a [`controller::Hearth`] configuration from RON, wires the
//! transport and recovery processor around a caller-supplied encryption
//! provider and either the configured store or externally provided store and
//! lock service, and runs the processor until shutdown.

pub mod controller;

pub use controller::{Hearth, Services, find_config_file};
