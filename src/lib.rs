//! Safety-monitoring core of a personal-safety client.
//!
//! Location tracking with danger-zone geofencing, shake-to-SOS, fake incoming
//! calls and evidence recording, talking to the safety backend over REST.
//! Device capabilities come in through the traits in [`platform`], so the
//! same core runs against Termux tools, mocks, or a native shell.

pub mod commands;
pub mod config;
pub mod contacts;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod fake_call;
pub mod gateway;
pub mod geofence;
pub mod location;
pub mod monitor;
pub mod notifications;
pub mod platform;
pub mod recording;
pub mod sensors;
pub mod shake;
pub mod sos;
pub mod status;
pub mod types;

pub use config::SafetyConfig;
pub use error::{Result, SafetyError};
pub use events::SafetyEvent;
pub use monitor::SafetyMonitor;
pub use platform::Platform;
pub use status::SafetyStatus;
