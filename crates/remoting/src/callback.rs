//! Function references crossing the wire
//!
//! A local function passed to the peer is exported under an id allocated by
//! the sending side. The receiving side wraps that id in a stub; invoking the
//! stub sends an event back, and the sender's event listener runs the
//! function.

use crate::value::Args;
use crate::{lock, RemotingError, Result};
use async_trait::async_trait;
use remoting_proto::{names, TypeDescriptor};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, trace, warn};

/// Function body of a local callback
pub type CallbackFn = dyn Fn(Args) + Send + Sync;

/// Delivers stub invocations to the peer that owns the function
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Send one invocation of callback `id`
    async fn send_event(&self, id: i32, args: Args) -> Result<()>;
}

#[derive(Clone)]
enum CallbackKind {
    Local(Arc<CallbackFn>),
    Stub(Arc<Stub>),
}

struct Stub {
    id: i32,
    sink: Weak<dyn EventSink>,
}

/// A function reference, local or owned by the peer
#[derive(Clone)]
pub struct Callback {
    kind: CallbackKind,
    descriptor: TypeDescriptor,
}

impl Callback {
    /// Wrap a local function
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Args) + Send + Sync + 'static,
    {
        Self {
            kind: CallbackKind::Local(Arc::new(f)),
            descriptor: TypeDescriptor::named(names::CALLBACK),
        }
    }

    /// Wrap a local function under a named callback type
    pub fn typed<F>(type_name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) + Send + Sync + 'static,
    {
        Self {
            kind: CallbackKind::Local(Arc::new(f)),
            descriptor: TypeDescriptor::new([type_name.into(), names::CALLBACK.to_string()]),
        }
    }

    /// Stub forwarding invocations of the peer's callback `id` to `sink`
    pub fn stub(id: i32, descriptor: TypeDescriptor, sink: Weak<dyn EventSink>) -> Self {
        Self {
            kind: CallbackKind::Stub(Arc::new(Stub { id, sink })),
            descriptor,
        }
    }

    /// Type chain of the callback
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    /// Whether the function lives in this process
    pub fn is_local(&self) -> bool {
        matches!(self.kind, CallbackKind::Local(_))
    }

    /// Peer id of a stub
    pub fn remote_id(&self) -> Option<i32> {
        match &self.kind {
            CallbackKind::Stub(stub) => Some(stub.id),
            CallbackKind::Local(_) => None,
        }
    }

    /// Identity used to deduplicate exports
    pub fn identity(&self) -> usize {
        match &self.kind {
            CallbackKind::Local(f) => Arc::as_ptr(f) as *const () as usize,
            CallbackKind::Stub(stub) => Arc::as_ptr(stub) as usize,
        }
    }

    /// Whether both handles refer to the same function
    pub fn ptr_eq(&self, other: &Callback) -> bool {
        self.identity() == other.identity()
    }

    /// Invoke the callback.
    ///
    /// Local functions run inline; stubs resolve once the event is written.
    pub async fn invoke(&self, args: Args) -> Result<()> {
        match &self.kind {
            CallbackKind::Local(f) => {
                f(args);
                Ok(())
            }
            CallbackKind::Stub(stub) => {
                let sink = stub.sink.upgrade().ok_or(RemotingError::ConnectionClosed)?;
                trace!(id = stub.id, args = args.len(), "Forwarding callback invocation");
                sink.send_event(stub.id, args).await
            }
        }
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CallbackKind::Local(_) => f
                .debug_struct("Callback")
                .field("type", &self.descriptor.name())
                .field("local", &true)
                .finish(),
            CallbackKind::Stub(stub) => f
                .debug_struct("Callback")
                .field("type", &self.descriptor.name())
                .field("remote_id", &stub.id)
                .finish(),
        }
    }
}

#[derive(Default)]
struct RelayState {
    /// Exported local functions by id
    local: HashMap<i32, Callback>,
    /// Export ids by function identity
    identities: HashMap<usize, i32>,
    /// Stubs for the peer's functions by the peer's id
    stubs: HashMap<i32, Callback>,
    last_id: i32,
}

/// Callback indices of one connection.
///
/// Ids are allocated by the exporting side, so each connection keeps its own
/// index in both directions.
#[derive(Default)]
pub struct CallbackRelay {
    state: Mutex<RelayState>,
}

impl fmt::Debug for CallbackRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("CallbackRelay")
            .field("exported", &state.local.len())
            .field("stubs", &state.stubs.len())
            .finish()
    }
}

impl CallbackRelay {
    /// Create empty indices
    pub fn new() -> Self {
        Self::default()
    }

    /// Export a local function, returning its id.
    ///
    /// Exporting the same function twice returns the same id. Stubs cannot be
    /// exported.
    pub fn export(&self, callback: &Callback) -> Result<i32> {
        if !callback.is_local() {
            return Err(RemotingError::Protocol(remoting_proto::ProtocolError::Unsupported(
                "a callback received from the peer cannot be passed on".into(),
            )));
        }

        let mut state = lock(&self.state);
        if let Some(&id) = state.identities.get(&callback.identity()) {
            return Ok(id);
        }

        state.last_id += 1;
        let id = state.last_id;
        state.identities.insert(callback.identity(), id);
        state.local.insert(id, callback.clone());
        debug!(id, "Exported callback");
        Ok(id)
    }

    /// Record a stub for the peer's callback `id`
    pub fn register_callback(&self, id: i32, stub: Callback) {
        lock(&self.state).stubs.insert(id, stub);
    }

    /// Stub for the peer's callback `id`, if one was created
    pub fn try_resolve_callback(&self, id: i32) -> Option<Callback> {
        lock(&self.state).stubs.get(&id).cloned()
    }

    /// Exported local function with `id`
    pub fn resolve_local(&self, id: i32) -> Option<Callback> {
        lock(&self.state).local.get(&id).cloned()
    }

    /// Stub for the peer's callback `id`, created on first use
    pub fn stub(&self, id: i32, descriptor: TypeDescriptor, sink: Weak<dyn EventSink>) -> Callback {
        let mut state = lock(&self.state);
        state
            .stubs
            .entry(id)
            .or_insert_with(|| Callback::stub(id, descriptor, sink))
            .clone()
    }

    /// Run the exported function `id` for an incoming event
    pub async fn dispatch(&self, id: i32, args: Args) -> Result<()> {
        match self.resolve_local(id) {
            Some(callback) => callback.invoke(args).await,
            None => {
                warn!(id, "Event for unknown callback");
                Err(RemotingError::dispatch(format!("unknown callback id {}", id)))
            }
        }
    }

    /// Number of exported local functions
    pub fn exported_count(&self) -> usize {
        lock(&self.state).local.len()
    }

    /// Number of stubs
    pub fn stub_count(&self) -> usize {
        lock(&self.state).stubs.len()
    }
}
