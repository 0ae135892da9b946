//! Tabcast Core - peer discovery and correlated request/response over a
//! broadcast transport.
//!
//! Independent contexts sharing one broadcast medium (browser tabs of one
//! origin, worker processes on one host, tasks on one in-process bus) use a
//! [`Connection`] to:
//!
//! - discover each other through periodic `discovery.online` beacons
//! - exchange namespaced `<channel>.<event>` messages
//! - make correlated request/response calls with timeouts
//! - designate one context as the **parent** that answers liveness pings,
//!   while **children** track whether that parent is reachable
//!
//! # Example
//!
//! ```rust,ignore
//! use tabcast_core::{Connection, LocalBus, Role};
//!
//! #[tokio::main]
//! async fn main() -> tabcast_core::Result<()> {
//!     let bus = LocalBus::new();
//!
//!     let parent = Connection::builder("my-app").role(Role::Parent).build(&bus)?;
//!     let child = Connection::builder("my-app").role(Role::Child).build(&bus)?;
//!
//!     child.on("connection", "online", |_| println!("parent reachable"));
//!     parent.start();
//!     child.start();
//!
//!     let answer = child.request("app", "compute", serde_json::json!({"n": 2})).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod role;
pub mod router;
pub mod timers;
pub mod transport;

// Re-export commonly used types
pub use config::{ConnectionOptions, ProtocolConfig};
pub use connection::{Connection, ConnectionBuilder, RequestOptions};
pub use envelope::{Envelope, Message, RequestBody, ResponseBody};
pub use error::{ConnectionError, Result};
pub use role::Role;
pub use router::{EventRouter, ListenerId};
pub use transport::{BroadcastTransport, ChannelBinding, Inbox, LocalBus};
