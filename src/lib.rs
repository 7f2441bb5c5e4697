//! Client that binds a local device to the ThinkAutomatic platform: device
//! identity, a resilient realtime channel, a local link server, scene
//! deduplication and advisory peripheral locks.

pub mod app;
pub mod channel;
pub mod config;
pub mod events;
pub mod identity;
pub mod locks;
pub mod model;
pub mod persist;
pub mod platform;
pub mod scenes;
pub mod server;
pub mod session;

pub use identity::Termination;
pub use model::{DeviceIdentity, Selector};
pub use session::{Session, SessionError};
