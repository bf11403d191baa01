//! Bridge Protocol Definitions
//!
//! This crate defines the wire vocabulary spoken between agents and the
//! bridge: fixed 4-byte flags, the protocol version table, the
//! length-prefixed connection codec and the link descriptor that precedes
//! every virtual stream.

pub mod addr;
pub mod conn;
pub mod flags;
pub mod link;
pub mod version;

pub use conn::{BridgeConn, ConnError, HealthReport};
pub use flags::{Flag, RoleTag};
pub use link::{ConnType, Link};

/// Maximum payload accepted by `BridgeConn::read_len_content` (32 KiB)
pub const MAX_SHORT_CONTENT: usize = 32 << 10;

/// Maximum JSON document accepted on the config channel (1 MiB)
pub const MAX_JSON_CONTENT: usize = 1 << 20;
