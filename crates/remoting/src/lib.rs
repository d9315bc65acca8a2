//! # Remoting
//!
//! Expose live objects over TCP or HTTP, call their methods from another
//! process through proxies, and pass callbacks in either direction.
//!
//! A server publishes objects by name in a [`Registry`] and serves them with
//! [`TcpServer`] or [`http::HttpServer`]. A client resolves them with
//! [`BinaryClient::get_object`] (or the HTTP equivalent) and calls methods on
//! the returned [`Proxy`].

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use remoting_proto as proto;

/// Error types for the remoting runtime
pub mod error;

/// Dynamic values crossing the wire
pub mod value;

/// Known type names and hierarchy fallback
pub mod types;

/// Exposed objects and their method tables
pub mod object;

/// Per-member access control
pub mod policy;

/// Published roots and object leases
pub mod registry;

/// Function references crossing the wire
pub mod callback;

/// Object and callback conversion at the serializer boundary
pub mod marshal;

/// Binary value serializer
pub mod binary;

/// XML value serializer
pub mod xml;

/// Multiplexed connection shared by both ends
pub mod session;

/// Client side dispatch and proxies
pub mod client;

/// Server side command handling
pub mod server;

/// TCP listener
pub mod tcp;

/// HTTP transport
#[cfg(feature = "http")]
#[cfg_attr(docsrs, doc(cfg(feature = "http")))]
pub mod http;

/// Configuration types
pub mod config;

pub use callback::{Callback, CallbackRelay};
pub use client::{BinaryClient, Dispatcher, FromProxy, Proxy};
pub use config::{ClientConfig, ServerConfig};
pub use error::RemotingError;
#[cfg(feature = "http")]
pub use http::{HttpClient, HttpServer};
pub use object::{Exposed, ObjectRef, RemoteClass, Reply};
pub use policy::{AccessPolicy, AllowList, Allowed, Denied};
pub use registry::{Lease, Registry};
pub use server::ServerConnection;
pub use tcp::TcpServer;
pub use types::TypeUniverse;
pub use value::{Args, FromValue, RemoteException, StructValue, Value};

/// Result type alias for remoting operations
pub type Result<T> = std::result::Result<T, RemotingError>;

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Build an [`Args`] list from values convertible into [`Value`]
#[macro_export]
macro_rules! args {
    () => {
        $crate::Args::new()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Args::from(vec![$($crate::Value::from($value)),+])
    };
}
