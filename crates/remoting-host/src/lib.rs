//! Remoting host
//!
//! Library half of the `remoting-host` binary: the demo objects it publishes
//! and the loading of its settings.

pub mod objects;
pub mod settings;

pub use objects::{publish, DEMO_OBJECTS};
pub use settings::{Cli, HostConfig};
