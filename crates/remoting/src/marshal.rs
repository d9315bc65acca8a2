//! Object and callback conversion at the serializer boundary
//!
//! Serializers never decide what an object id means. Each end of a
//! connection supplies a [`Marshal`] that knows its role: a server hands out
//! lease ids for its objects and resolves ids back to leases, a client turns
//! ids into cached proxies and sends proxies back by id.

use crate::callback::Callback;
use crate::object::ObjectRef;
use crate::types::TypeUniverse;
use crate::Result;
use remoting_proto::TypeDescriptor;

/// Converts live references to wire ids and back
pub trait Marshal: Send + Sync {
    /// Id and type chain to send for an object
    fn export_object(&self, object: &ObjectRef) -> Result<(i32, TypeDescriptor)>;

    /// Object for an id received from the peer
    fn import_object(&self, id: i32, descriptor: TypeDescriptor) -> Result<ObjectRef>;

    /// Id to send for a callback
    fn export_callback(&self, callback: &Callback) -> Result<i32>;

    /// Callback for an id received from the peer
    fn import_callback(&self, id: i32, descriptor: TypeDescriptor) -> Result<Callback>;

    /// Types known on this end
    fn universe(&self) -> &TypeUniverse;
}
