pub mod catalog;
pub mod config;
pub mod controller;
pub mod error;
pub mod external;
pub mod persistence;
pub mod resources;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use controller::{Controller, ControllerHandle, SchedulerCore};
pub use error::{Result, SchedError};
