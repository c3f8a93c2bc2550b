//! Engine-wide coordination

pub mod emergency_stop;

pub use emergency_stop::{EmergencyReason, EmergencyState, EmergencyStopManager};
