//! ssrelay CLI Library
//!
//! Link tools, the standalone link prober and management of the relays on
//! this host.

pub mod context;
pub mod link_cmd;
pub mod probe_cmd;
pub mod relay_cmd;
