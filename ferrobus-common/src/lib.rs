//! Wire protocol layer of the Ferrobus message bus library: validated
//! identifier types, dynamic values, static signature derivation, the
//! message model with its codec, bus address handling and the shared error
//! type.

pub mod address;
pub mod arg;
mod codec;
pub mod errors;
pub mod message;
pub mod names;
pub mod types;
pub mod value;

pub use arg::{ArgList, BasicType, BusType};
pub use errors::{Error, Result};
pub use message::{EitherFrame, Message, MessageKind, Reader, Writer};
pub use types::{ObjectPath, Signature, UnixFd};
pub use value::{Value, Variant};

/// The bus daemon's well-known name.
pub const DAEMON_NAME: &str = "org.freedesktop.DBus";
/// The bus daemon's object path.
pub const DAEMON_PATH: &str = "/org/freedesktop/DBus";
/// The bus daemon's management interface.
pub const DAEMON_INTERFACE: &str = "org.freedesktop.DBus";

/// Interface of the standard property protocol.
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
/// Interface every peer answers liveness queries on.
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
/// Interface serving the introspection document.
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// `RequestName` flags.
pub mod request_name_flags {
    pub const ALLOW_REPLACEMENT: u32 = 0x1;
    pub const REPLACE_EXISTING: u32 = 0x2;
    pub const DO_NOT_QUEUE: u32 = 0x4;
}

/// `RequestName` reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

impl RequestNameReply {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::PrimaryOwner),
            2 => Some(Self::InQueue),
            3 => Some(Self::Exists),
            4 => Some(Self::AlreadyOwner),
            _ => None,
        }
    }
}

/// `ReleaseName` reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

impl ReleaseNameReply {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Released),
            2 => Some(Self::NonExistent),
            3 => Some(Self::NotOwner),
            _ => None,
        }
    }
}
