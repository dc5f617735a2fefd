use thiserror::Error;

/// Error names used on the wire when a dispatch miss or a property failure
/// is answered with an error reply.
pub mod wire_names {
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Failed to open a bus connection: {0}")]
    ConnectionFailed(String),
    #[error("Bus connection is closed")]
    Disconnected,
    #[error("Failed to queue an outgoing message: {0}")]
    SendFailure(String),
    #[error("No reply within the configured timeout")]
    Timeout,
    #[error("Call cancelled")]
    Cancelled,
    #[error("{name}: {message}")]
    Remote { name: String, message: String },
    #[error("No object registered on path `{0}`")]
    UnknownObject(String),
    #[error("Unknown method `{0}`")]
    UnknownMethod(String),
    #[error("Unknown interface `{0}`")]
    UnknownInterface(String),
    #[error("Unknown property `{0}`")]
    UnknownProperty(String),
    #[error("Type mismatch: expected `{expected}`, found `{actual}`")]
    TypeMismatch { expected: char, actual: char },
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Invalid object path `{0}`")]
    InvalidObjectPath(String),
    #[error("Invalid name `{0}`")]
    InvalidName(String),
    #[error("Property `{0}` is read-only")]
    ReadOnly(String),
    #[error("Name `{0}` is owned by another connection")]
    AlreadyOwned(String),
    #[error("Name `{0}` is already owned by this connection")]
    AlreadyOwner(String),
    #[error("Name `{0}` is not owned by this connection")]
    NotOwner(String),
    #[error("Name `{0}` does not exist on the bus")]
    NameNonExistent(String),
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),
    #[error("Blocking call on a bus that is driven by an executor")]
    BlockingOnBoundBus,
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Out of memory")]
    NoMemory,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wire name this error is sent under when used as an error reply.
    pub fn wire_name(&self) -> &str {
        match self {
            Error::Remote { name, .. } => name,
            Error::UnknownObject(_) => wire_names::UNKNOWN_OBJECT,
            Error::UnknownMethod(_) => wire_names::UNKNOWN_METHOD,
            Error::UnknownInterface(_) => wire_names::UNKNOWN_INTERFACE,
            Error::UnknownProperty(_) => wire_names::UNKNOWN_PROPERTY,
            Error::ReadOnly(_) => wire_names::PROPERTY_READ_ONLY,
            Error::TypeMismatch { .. } | Error::InvalidSignature(_) => wire_names::INVALID_ARGS,
            _ => wire_names::FAILED,
        }
    }

    /// Map an error reply received from a peer back onto a specific error
    /// kind where a well-known name exists. Everything else stays remote.
    pub fn from_reply(name: &str, message: String) -> Self {
        match name {
            wire_names::UNKNOWN_OBJECT => Error::UnknownObject(message),
            wire_names::UNKNOWN_METHOD => Error::UnknownMethod(message),
            wire_names::UNKNOWN_INTERFACE => Error::UnknownInterface(message),
            wire_names::UNKNOWN_PROPERTY => Error::UnknownProperty(message),
            wire_names::PROPERTY_READ_ONLY => Error::ReadOnly(message),
            _ => Error::Remote {
                name: name.into(),
                message,
            },
        }
    }
}
