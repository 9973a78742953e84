//! Relay process management: launcher collaborator, PID files, lifecycle control.

pub mod controller;
pub mod launcher;
pub mod pidfile;

pub use controller::{ControllerError, ProcessController, StartOutcome, StopOutcome};
pub use launcher::{Launcher, LauncherAction, LauncherError, LauncherOutput, ScriptLauncher};
