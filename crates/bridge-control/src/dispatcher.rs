//! Role classification of authenticated connections

use bridge_proto::{BridgeConn, ConnError, RoleTag};
use tokio::io::AsyncRead;

/// What an authenticated connection is for, with the payload each role
/// carries after its tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Control connection (`main`)
    Signal,
    /// Data-tunnel multiplexer (`chan`)
    Tunnel,
    /// File-service multiplexer (`file`)
    File,
    /// Configuration sub-protocol (`conf`)
    Config,
    /// Authorize the caller's IP for `hours` (`rgst`)
    Register { hours: i32 },
    /// Hand the connection to the secret-tunnel consumer (`sert`)
    Secret { password_hash: [u8; 32] },
    /// P2P rendezvous request (`p2pm`)
    P2p { password_hash: [u8; 32] },
}

impl Role {
    /// Read whatever payload follows `tag`
    pub async fn read<S>(tag: RoleTag, conn: &mut BridgeConn<S>) -> Result<Self, ConnError>
    where
        S: AsyncRead + Unpin,
    {
        let role = match tag {
            RoleTag::Signal => Role::Signal,
            RoleTag::Tunnel => Role::Tunnel,
            RoleTag::File => Role::File,
            RoleTag::Config => Role::Config,
            RoleTag::Register => Role::Register {
                hours: conn.read_i32().await?,
            },
            RoleTag::Secret => Role::Secret {
                password_hash: conn.read_array::<32>().await?,
            },
            RoleTag::P2p => Role::P2p {
                password_hash: conn.read_array::<32>().await?,
            },
        };
        Ok(role)
    }

    pub fn tag(&self) -> RoleTag {
        match self {
            Role::Signal => RoleTag::Signal,
            Role::Tunnel => RoleTag::Tunnel,
            Role::File => RoleTag::File,
            Role::Config => RoleTag::Config,
            Role::Register { .. } => RoleTag::Register,
            Role::Secret { .. } => RoleTag::Secret,
            Role::P2p { .. } => RoleTag::P2p,
        }
    }
}
