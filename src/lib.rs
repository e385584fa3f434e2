//! Scripted system tests for emulated machines.
//!
//! The harness launches an emulator whose console and monitor share stdio,
//! watches the guest's log stream for expected lines and scheduler idleness,
//! and drives the guest's keyboard, mouse and screen through monitor
//! commands.

pub mod artifacts;
pub mod cli;
pub mod config;
pub mod failure;
pub mod idle;
pub mod log;
pub mod oracle;
pub mod scenario;
pub mod session;
pub mod signals;
pub mod transport;
pub mod watchdog;
