#![warn(missing_docs)]

//! blockwatch management: daemon configuration, control surface and the `bw-mgmt` CLI

pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod monitor;

pub use config::DaemonConfig;
pub use control::{ControlSurface, DeviceSummary};
pub use error::{MgmtError, MgmtResult};
pub use monitor::Monitor;
