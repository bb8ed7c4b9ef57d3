//! Network servers
//!
//! - [`StreamServer`]: negotiates a stream per connection and attaches the
//!   socket to a shared session
//! - [`TriggerServer`]: turns bare connects into trigger/detrigger calls
//!
//! Either can announce itself into a discovery registry through an
//! [`Announcer`].

pub mod config;
pub mod discovery;
pub mod listener;
pub mod trigger;

pub use config::ServerConfig;
pub use discovery::{Announcer, DiscoveryConfig};
#[cfg(feature = "redis")]
pub use discovery::RedisAnnouncer;
pub use listener::StreamServer;
pub use trigger::{TriggerConfig, TriggerHandler, TriggerServer};
