//! Ambient infrastructure shared by every crate in the workspace: process
//! wiring, logging, time/id helpers. Nothing here knows about certificates,
//! tokens, or MQTT — that belongs to `fleet-pki`.

pub mod arc;
pub mod ids;
pub mod logging;
pub mod responsechannel;
pub mod shutdown;
pub mod time;

pub use arc::{Atomic, AtomicOption};
