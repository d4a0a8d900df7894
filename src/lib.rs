//! OBS Sync - keep several OBS Studio instances visually identical on a LAN.
//!
//! The master observes its local OBS instance and propagates scene
//! selection, scene-item transforms, filter settings, and image-source
//! contents to connected slaves; each slave applies the stream to its own
//! OBS and periodically checks for drift from the master's intended state.

pub mod api;
pub mod engine;
pub mod error;
pub mod master;
pub mod metrics;
pub mod obs;
pub mod paths;
pub mod protocol;
pub mod settings;
pub mod slave;

pub use engine::{AppMode, DesyncAlert, ShellEvent, SyncEngine};
pub use error::{Result, SyncError};
pub use protocol::{SyncMessage, SyncTargetType};
