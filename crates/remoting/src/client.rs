//! Client side dispatch and proxies
//!
//! A [`Proxy`] is the caller's handle on an object living in the server. It
//! carries the server's id and type chain and forwards every call through
//! the [`Dispatcher`] of the connection it came from. Proxies are cached per
//! connection and id, so resolving the same object twice yields the same
//! handle.

use crate::callback::{Callback, CallbackRelay, EventSink};
use crate::config::ClientConfig;
use crate::marshal::Marshal;
use crate::object::{ObjectRef, Reply};
use crate::session::{Session, SessionChannels};
use crate::types::TypeUniverse;
use crate::value::{Args, Value};
use crate::{lock, RemotingError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use remoting_proto::{Multiplexer, ProtocolError, TypeDescriptor};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Method answered by the proxy itself
pub const GET_TYPE: &str = "GetType";

/// Sends requests on behalf of proxies
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Resolve a published object by name
    async fn get_object(&self, name: &str) -> Result<Proxy>;

    /// Call a method on a proxied object
    async fn invoke(&self, target: &Proxy, method: &str, args: Args) -> Result<Reply>;

    /// Id of the connection
    fn session_id(&self) -> Uuid;

    /// Types known on the client
    fn universe(&self) -> &TypeUniverse;
}

/// Hand-written typed stand-in for a remote class
pub trait FromProxy: Sized {
    /// Type name the remote object must carry in its chain
    const TYPE_NAME: &'static str;

    /// Wrap a proxy known to carry [`Self::TYPE_NAME`]
    fn from_proxy(proxy: Proxy) -> Self;
}

struct ProxyInner {
    id: i32,
    descriptor: TypeDescriptor,
    type_name: String,
    dispatcher: Arc<dyn Dispatcher>,
}

/// Handle on an object served by the peer
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    /// Server id of the object
    pub fn id(&self) -> i32 {
        self.inner.id
    }

    /// Type chain sent by the server
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.inner.descriptor
    }

    /// Most-derived type of the chain known on this side
    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    /// Id of the connection the proxy belongs to
    pub fn session_id(&self) -> Uuid {
        self.inner.dispatcher.session_id()
    }

    /// Whether both handles are the same cached proxy
    pub fn ptr_eq(&self, other: &Proxy) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Call a method and return its result
    pub async fn invoke(&self, method: &str, args: Args) -> Result<Value> {
        Ok(self.invoke_with(method, args).await?.value)
    }

    /// Call a method and return its result with the by-reference parameters
    pub async fn invoke_with(&self, method: &str, args: Args) -> Result<Reply> {
        if method == GET_TYPE && args.is_empty() {
            return Ok(Reply::new(self.type_name()));
        }
        trace!(id = self.id(), method, args = args.len(), "Invoking remote method");
        self.inner.dispatcher.invoke(self, method, args).await
    }

    /// Call a method, copying by-reference parameters back into `slots`
    pub async fn invoke_mut(&self, method: &str, slots: &mut [Value]) -> Result<Value> {
        let reply = self.invoke_with(method, Args::from(slots.to_vec())).await?;
        for (index, value) in reply.out {
            let slot = slots.get_mut(index).ok_or_else(|| {
                ProtocolError::InvalidFrame(format!("out parameter {} is out of range", index))
            })?;
            *slot = value;
        }
        Ok(reply.value)
    }

    /// Call a method and convert its result
    pub async fn call<T: crate::FromValue>(&self, method: &str, args: Args) -> Result<T> {
        self.invoke(method, args).await?.into_typed()
    }

    /// Wrap in a typed stand-in, checking the type chain
    pub fn into_typed<T: FromProxy>(self) -> Result<T> {
        if self.descriptor().is(T::TYPE_NAME) {
            Ok(T::from_proxy(self))
        } else {
            Err(RemotingError::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                found: self.descriptor().name().to_string(),
            })
        }
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.inner.id)
            .field("type", &self.inner.type_name)
            .finish()
    }
}

/// Proxies of one connection by server id.
///
/// Entries are weak: a proxy nobody holds is rebuilt on the next reference.
#[derive(Default)]
pub(crate) struct ProxyCache {
    entries: Mutex<HashMap<i32, Weak<ProxyInner>>>,
}

impl ProxyCache {
    /// Cached proxy for `id`, created on first use
    pub(crate) fn get_or_create(
        &self,
        id: i32,
        descriptor: TypeDescriptor,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Proxy {
        let mut entries = lock(&self.entries);
        if let Some(inner) = entries.get(&id).and_then(Weak::upgrade) {
            return Proxy { inner };
        }

        entries.retain(|_, entry| entry.strong_count() > 0);
        let type_name = dispatcher.universe().resolve(&descriptor);
        let inner = Arc::new(ProxyInner {
            id,
            descriptor,
            type_name,
            dispatcher,
        });
        entries.insert(id, Arc::downgrade(&inner));
        debug!(id, type_name = %inner.type_name, "Created proxy");
        Proxy { inner }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }
}

/// Checks that a proxy sent back to the server belongs to this connection
pub(crate) fn export_proxy(session_id: Uuid, object: &ObjectRef) -> Result<(i32, TypeDescriptor)> {
    match object {
        ObjectRef::Proxy(proxy) if proxy.session_id() == session_id => {
            Ok((proxy.id(), proxy.descriptor().clone()))
        }
        ObjectRef::Proxy(proxy) => Err(RemotingError::dispatch(format!(
            "proxy {} belongs to another connection",
            proxy.id()
        ))),
        ObjectRef::Exposed(exposed) => Err(ProtocolError::Unsupported(format!(
            "a client cannot expose {}",
            exposed.class().name()
        ))
        .into()),
    }
}

/// Marshal of the calling end of a binary connection
struct ClientMarshal {
    session_id: Uuid,
    core: Weak<ClientCore>,
    proxies: Arc<ProxyCache>,
    relay: Arc<CallbackRelay>,
    sink: Weak<dyn EventSink>,
    universe: Arc<TypeUniverse>,
}

impl Marshal for ClientMarshal {
    fn export_object(&self, object: &ObjectRef) -> Result<(i32, TypeDescriptor)> {
        export_proxy(self.session_id, object)
    }

    fn import_object(&self, id: i32, descriptor: TypeDescriptor) -> Result<ObjectRef> {
        let core = self.core.upgrade().ok_or(RemotingError::ConnectionClosed)?;
        Ok(ObjectRef::Proxy(self.proxies.get_or_create(id, descriptor, core)))
    }

    fn export_callback(&self, callback: &Callback) -> Result<i32> {
        self.relay.export(callback)
    }

    fn import_callback(&self, id: i32, descriptor: TypeDescriptor) -> Result<Callback> {
        Ok(self.relay.stub(id, descriptor, self.sink.clone()))
    }

    fn universe(&self) -> &TypeUniverse {
        &self.universe
    }
}

struct ClientCore {
    session: Arc<Session>,
    /// At most one request in flight on `Commands`
    command_lock: Arc<tokio::sync::Mutex<()>>,
    proxies: Arc<ProxyCache>,
    universe: Arc<TypeUniverse>,
}

impl ClientCore {
    /// Write a request and read its response in a task of its own.
    ///
    /// The task owns the command lock until the response has been read, so a
    /// caller dropping its future mid-exchange leaves `Commands` at a message
    /// boundary for the next request.
    async fn exchange(&self, request: Bytes, expect: Expect) -> Result<Response> {
        let session = Arc::clone(&self.session);
        let guard = Arc::clone(&self.command_lock).lock_owned().await;

        let task = tokio::spawn(async move {
            let response = run_exchange(&session, &request, expect).await;
            drop(guard);
            response
        });

        match task.await {
            Ok(response) => response,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(RemotingError::ConnectionClosed),
        }
    }
}

async fn run_exchange(session: &Session, request: &[u8], expect: Expect) -> Result<Response> {
    let mut commands = session.commands().clone();
    commands.write(request).await?;

    let serializer = session.binary();
    match expect {
        Expect::GetResult => serializer.decode_get_result(&mut commands).await.map(Response::Get),
        Expect::CallResult => serializer.decode_call_result(&mut commands).await.map(Response::Call),
    }
}

#[derive(Clone, Copy)]
enum Expect {
    GetResult,
    CallResult,
}

enum Response {
    Get(Value),
    Call(Reply),
}

#[async_trait]
impl Dispatcher for ClientCore {
    async fn get_object(&self, name: &str) -> Result<Proxy> {
        let request = self.session.binary().encode_get(name).freeze();

        match self.exchange(request, Expect::GetResult).await? {
            Response::Get(Value::Object(ObjectRef::Proxy(proxy))) => Ok(proxy),
            Response::Get(other) => Err(RemotingError::TypeMismatch {
                expected: remoting_proto::names::REMOTE_OBJECT.to_string(),
                found: other.type_name(),
            }),
            Response::Call(_) => Err(ProtocolError::InvalidFrame("call reply to a Get".into()).into()),
        }
    }

    async fn invoke(&self, target: &Proxy, method: &str, args: Args) -> Result<Reply> {
        let request = self.session.binary().encode_call(target.id(), method, &args)?.freeze();

        match self.exchange(request, Expect::CallResult).await? {
            Response::Call(reply) => Ok(reply),
            Response::Get(_) => Err(ProtocolError::InvalidFrame("get reply to a Call".into()).into()),
        }
    }

    fn session_id(&self) -> Uuid {
        self.session.id()
    }

    fn universe(&self) -> &TypeUniverse {
        &self.universe
    }
}

/// Client end of a binary connection
#[derive(Clone)]
pub struct BinaryClient {
    core: Arc<ClientCore>,
}

impl fmt::Debug for BinaryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryClient")
            .field("session", &self.core.session.id())
            .field("proxies", &self.core.proxies.len())
            .finish()
    }
}

impl BinaryClient {
    /// Connect to a TCP server with default settings
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::connect_with(addr, ClientConfig::default()).await
    }

    /// Connect to a TCP server
    pub async fn connect_with(addr: impl ToSocketAddrs, config: ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let client = Self::with_config(reader, writer, config).await?;
        info!(session = %client.session_id(), %peer, "Connected");
        Ok(client)
    }

    /// Run the client over any byte stream pair
    pub async fn new<R, W>(reader: R, writer: W) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(reader, writer, ClientConfig::default()).await
    }

    /// Run the client over any byte stream pair with explicit settings
    pub async fn with_config<R, W>(reader: R, writer: W, config: ClientConfig) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mux = Multiplexer::new(reader, writer, config.mux);
        let channels = SessionChannels::open(mux).await?;
        let universe = Arc::new(TypeUniverse::new());
        let proxies = Arc::new(ProxyCache::default());

        let core = Arc::new_cyclic(|core: &Weak<ClientCore>| {
            let session = Session::new(channels, |ctx| {
                Box::new(ClientMarshal {
                    session_id: ctx.id,
                    core: core.clone(),
                    proxies: Arc::clone(&proxies),
                    relay: ctx.relay,
                    sink: ctx.sink,
                    universe: Arc::clone(&universe),
                })
            });
            ClientCore {
                session,
                command_lock: Arc::new(tokio::sync::Mutex::new(())),
                proxies,
                universe,
            }
        });
        core.session.start();

        Ok(Self { core })
    }

    /// Resolve a published object by name
    pub async fn get_object(&self, name: &str) -> Result<Proxy> {
        self.core.get_object(name).await
    }

    /// Resolve a published object as a typed stand-in
    pub async fn get_typed<T: FromProxy>(&self, name: &str) -> Result<T> {
        self.get_object(name).await?.into_typed()
    }

    /// Types known on this side; register names before resolving objects
    pub fn universe(&self) -> &Arc<TypeUniverse> {
        &self.core.universe
    }

    /// The client as a [`Dispatcher`]
    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        self.core.clone()
    }

    /// Callback indices of the connection
    pub fn relay(&self) -> &Arc<CallbackRelay> {
        self.core.session.relay()
    }

    /// Id of the connection
    pub fn session_id(&self) -> Uuid {
        self.core.session.id()
    }

    /// Whether the connection has ended
    pub fn is_closed(&self) -> bool {
        self.core.session.is_closed()
    }

    /// Close the connection
    pub async fn close(&self) {
        self.core.session.shutdown().await;
    }
}
