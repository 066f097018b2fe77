//! # Orvibo
//!
//! Asynchronous local control of Orvibo S20 WiFi smart plugs over their UDP
//! protocol, without cloud dependencies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use orvibo::{Client, Config};
//!
//! # async fn run() -> orvibo::error::Result<()> {
//! let client = Client::bind(Config::default())?;
//! for host in client.discover().await {
//!     let plug = client.open_session(&host.to_string()).await?;
//!     println!("{} is {}", host, if plug.get_state().await? { "ON" } else { "OFF" });
//! }
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
mod macros;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transaction;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::Client;
pub use config::Config;
pub use device::{Device, DeviceInfo};
pub use error::OrviboError;
pub use protocol::{Command, Frame, MacAddress};
pub use registry::StateEvent;
pub use transport::{Transport, UdpTransport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
