use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The entity kinds known to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Adapter,
    Device,
    Session,
    Transfer,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::Adapter => "adapter",
            EntityKind::Device => "device",
            EntityKind::Session => "session",
            EntityKind::Transfer => "transfer",
        };
        f.write_str(name)
    }
}

/// A required property was absent or carried no usable value.
///
/// Decoding one entity must never abort a batch; callers skip the
/// offending entity and continue with its siblings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot decode {kind} at '{path}': missing or invalid field '{field}'")]
pub struct DecodeError {
    pub kind: EntityKind,
    pub path: String,
    pub field: &'static str,
}

impl DecodeError {
    pub fn new(kind: EntityKind, path: impl Into<String>, field: &'static str) -> Self {
        Self {
            kind,
            path: path.into(),
            field,
        }
    }
}

/// Errors surfaced by the coordination core.
#[derive(Debug, Error)]
pub enum Error {
    /// A remote call failed or the bus is unreachable. The attempted
    /// action aborts and the cache is left unchanged.
    #[error("remote call failed: {0}")]
    Transport(#[from] zbus::Error),

    #[error("remote call failed: {0}")]
    Bus(#[from] zbus::fdo::Error),

    #[error("invalid wire value: {0}")]
    Value(#[from] zbus::zvariant::Error),

    #[error("invalid d-bus name: {0}")]
    Name(#[from] zbus::names::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A second foreground operation was attempted while one is active.
    #[error("another operation is already in progress")]
    Busy,

    #[error("no bluetooth adapters are present")]
    NoAdapters,

    /// Suspend, resume and cancel are not locally controllable for a
    /// receiving transfer.
    #[error("operation is not supported for a receiving transfer")]
    UnsupportedOperation,

    /// The per-adapter advisory send lock could not be acquired.
    #[error("a file transfer is already active on adapter '{0}'")]
    SendInProgress(String),

    /// The user declined an incoming transfer.
    #[error("incoming transfer was rejected")]
    Rejected,

    #[error("tethering connection for '{0}' is already active")]
    NetworkActive(String),

    #[error("no network device found for address '{0}'")]
    NoNetworkDevice(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
