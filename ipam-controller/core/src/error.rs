use crate::{allocator::AllocError, store::StorageError};
use ipnet::IpNet;

/// Classifies failures so that callers can decide how to react without inspecting messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A malformed CIDR or IP, or a missing required parameter.
    Invalid,

    /// The requested network collides with a pool, a cluster subnet or a reserved subnet.
    Overlap,

    /// No network or IP of the required size is left.
    Exhausted,

    /// The operation depends on a setup step that has not happened yet.
    MissingInit,

    /// The durable store failed.
    Storage,

    /// The engine has been closed.
    Unavailable,

    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("{network} overlaps with {owner} {conflict}")]
    Overlap {
        network: IpNet,
        owner: String,
        conflict: IpNet,
    },

    #[error("no network of length /{0} is available in any pool")]
    Exhausted(u8),

    #[error("{0} has not been initialized")]
    MissingInit(String),

    #[error("IPAM is closed")]
    Closed,

    #[error(transparent)]
    Allocator(#[from] AllocError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<Error>,
    },
}

// === impl Error ===

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub(crate) fn missing_init(what: impl Into<String>) -> Self {
        Self::MissingInit(what.into())
    }

    /// Wraps the error with the operation and identifiers involved. The kind is preserved.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::Overlap { .. } => ErrorKind::Overlap,
            Self::Exhausted(_) => ErrorKind::Exhausted,
            Self::MissingInit(_) => ErrorKind::MissingInit,
            Self::Closed => ErrorKind::Unavailable,
            Self::Allocator(error) => error.kind(),
            Self::Storage(_) => ErrorKind::Storage,
            Self::Context { source, .. } => source.kind(),
        }
    }

    pub fn is_missing_init(&self) -> bool {
        self.kind() == ErrorKind::MissingInit
    }
}

impl AllocError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Overlap { .. }
            | Self::HasIps(_)
            | Self::HasChildren(_)
            | Self::IpAlreadyAllocated { .. } => ErrorKind::Overlap,
            Self::NoPrefixAvailable { .. } | Self::NoIpAvailable(_) => ErrorKind::Exhausted,
            Self::InvalidLength { .. } | Self::NotCanonical(_) | Self::OutOfRange { .. } => {
                ErrorKind::Invalid
            }
            _ => ErrorKind::Internal,
        }
    }
}
