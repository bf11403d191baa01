//! Fixed 4-byte tokens exchanged on bridge connections

use std::fmt;

/// A raw 4-byte ASCII flag as read from the wire
pub type Flag = [u8; 4];

/// Connection test marker sent by agents before anything else
pub const CONN_TEST: &[u8; 3] = b"TST";

/// Authentication rejected (non-strict mode only)
pub const VERIFY_ERR: &Flag = b"vkey";
/// Authentication accepted (legacy handshake)
pub const VERIFY_SUCCESS: &Flag = b"sucs";

pub const WORK_MAIN: &Flag = b"main";
pub const WORK_CHAN: &Flag = b"chan";
pub const WORK_FILE: &Flag = b"file";
pub const WORK_CONFIG: &Flag = b"conf";
pub const WORK_REGISTER: &Flag = b"rgst";
pub const WORK_SECRET: &Flag = b"sert";
pub const WORK_P2P: &Flag = b"p2pm";
pub const WORK_STATUS: &Flag = b"stus";

/// Close notice pushed to a replaced signal connection
pub const RES_CLOSE: &Flag = b"clse";
/// P2P rendezvous push
pub const NEW_UDP_CONN: &Flag = b"udpc";

pub const NEW_TASK: &Flag = b"task";
pub const NEW_CONF: &Flag = b"conf";
pub const NEW_HOST: &Flag = b"host";

/// Separator used inside health reports and status replies
pub const CONN_DATA_SEQ: &str = "*#*";

/// Role a freshly authenticated connection declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleTag {
    Signal,
    Tunnel,
    File,
    Config,
    Register,
    Secret,
    P2p,
}

impl RoleTag {
    pub fn from_flag(flag: &Flag) -> Option<Self> {
        match flag {
            b"main" => Some(RoleTag::Signal),
            b"chan" => Some(RoleTag::Tunnel),
            b"file" => Some(RoleTag::File),
            b"conf" => Some(RoleTag::Config),
            b"rgst" => Some(RoleTag::Register),
            b"sert" => Some(RoleTag::Secret),
            b"p2pm" => Some(RoleTag::P2p),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> &'static Flag {
        match self {
            RoleTag::Signal => WORK_MAIN,
            RoleTag::Tunnel => WORK_CHAN,
            RoleTag::File => WORK_FILE,
            RoleTag::Config => WORK_CONFIG,
            RoleTag::Register => WORK_REGISTER,
            RoleTag::Secret => WORK_SECRET,
            RoleTag::P2p => WORK_P2P,
        }
    }
}

impl fmt::Display for RoleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_flag()))
    }
}
