//! ssrelay Daemon Library
//!
//! Core functionality for managing a relay fleet on one host:
//! - Filesystem-backed relay registry with a recycle bin
//! - Process lifecycle control through an external launcher and PID files
//! - Concurrent TCP connectivity probing
//! - Periodic recycle bin sweeping
//! - Fleet flows combining the above (add, update, delete, diagnose)

pub mod fleet;
pub mod probe;
pub mod process;
pub mod registry;
pub mod sweeper;

pub use fleet::{Fleet, FleetError};
pub use registry::{Registry, RegistryError};
pub use sweeper::RecycleSweeper;
