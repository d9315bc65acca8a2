//! Error types for the remoting runtime

use crate::value::RemoteException;
use remoting_proto::{names, ProtocolError};
use thiserror::Error;

/// Main error type for remoting operations
#[derive(Debug, Error)]
pub enum RemotingError {
    /// Framing, wire format or channel failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Object or method could not be located
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Access policy refused the member
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The remote method failed
    #[error("Remote failure: {0}")]
    Remote(RemoteException),

    /// A value did not have the expected type
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Type the caller asked for
        expected: String,
        /// Type that was present
        found: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// The connection ended
    #[error("Connection closed")]
    ConnectionClosed,
}

impl RemotingError {
    /// Create a dispatch error
    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::Dispatch(msg.into())
    }

    /// Encode the error as a wire exception
    pub fn to_exception(&self) -> RemoteException {
        match self {
            Self::Remote(exception) => exception.clone(),
            Self::Dispatch(msg) => RemoteException::new(names::DISPATCH_ERROR, msg.clone()),
            Self::AccessDenied(member) => RemoteException::new(names::ACCESS_DENIED, member.clone()),
            other => RemoteException::new(names::EXCEPTION, other.to_string()),
        }
    }

    /// Decode a wire exception, restoring the dispatch and access kinds
    pub fn from_exception(exception: RemoteException) -> Self {
        match exception.type_name.as_str() {
            names::DISPATCH_ERROR => Self::Dispatch(exception.message),
            names::ACCESS_DENIED => Self::AccessDenied(exception.message),
            _ => Self::Remote(exception),
        }
    }

    /// Whether the error means the connection is gone
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::Io(_) => true,
            Self::Protocol(e) => e.is_disconnect(),
            _ => false,
        }
    }
}

impl From<RemotingError> for RemoteException {
    fn from(err: RemotingError) -> Self {
        err.to_exception()
    }
}

impl From<quick_xml::Error> for RemotingError {
    fn from(err: quick_xml::Error) -> Self {
        Self::Protocol(ProtocolError::Xml(err.to_string()))
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for RemotingError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
