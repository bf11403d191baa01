//! Control-plane bridge for reverse tunnels
//!
//! Agents dial the bridge, authenticate, and declare what each physical
//! connection is for. The bridge keeps one [`ClientSession`] per agent and
//! lets proxy front-ends open virtual streams toward an agent through
//! [`Bridge::send_link_info`].

pub mod bridge;
pub mod config;
pub mod config_protocol;
pub mod dispatcher;
pub mod handshake;
pub mod health;
pub mod ip_registry;
pub mod link;
pub mod liveness;
pub mod session;
pub mod store;

pub use bridge::{Bridge, BridgeChannels, BridgeStream, PortProbe, RunList, SecretRequest, SystemPortProbe};
pub use config::BridgeConfig;
pub use config_protocol::ConfigProtocolError;
pub use dispatcher::Role;
pub use handshake::{Authenticated, HandshakeError};
pub use ip_registry::{IpRegistry, IpRejection};
pub use link::{LinkError, LinkStream};
pub use session::{ClientSession, SessionRegistry, SignalConn};
pub use store::{Client, Host, MemoryStore, Store, StoreError, StoreSeed, Target, TargetPool, Task, TaskMode};
