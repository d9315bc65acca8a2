//! Server side command handling
//!
//! One [`ServerConnection`] serves one accepted binary connection: it reads a
//! command byte from `Commands`, answers it, and repeats until the transport
//! goes away. Failures while handling a single command are sent back as
//! `Exception` responses and the loop keeps serving.

use crate::binary::{BinarySerializer, CallMessage};
use crate::callback::{Callback, CallbackRelay, EventSink};
use crate::config::ServerConfig;
use crate::marshal::Marshal;
use crate::object::{Exposed, ObjectRef, Reply};
use crate::policy::{AccessPolicy, Allowed};
use crate::registry::{Lease, Registry};
use crate::session::{Session, SessionChannels};
use crate::types::TypeUniverse;
use crate::value::{Args, Value};
use crate::{lock, RemotingError, Result};
use remoting_proto::{ByteSource, Channel, Command, Multiplexer, ProtocolError, TypeDescriptor};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Run one call against a lease.
///
/// Returns the reply and the policy that objects in it are leased with.
pub(crate) async fn invoke_lease(
    lease: &Lease,
    method: &str,
    signature: &[TypeDescriptor],
    args: Args,
) -> Result<(Reply, Arc<dyn AccessPolicy>)> {
    // Objects are matched by their real chain, not by what the caller declared
    let arg_types: Vec<TypeDescriptor> = signature
        .iter()
        .zip(args.iter())
        .map(|(declared, value)| match value {
            Value::Object(_) | Value::Callback(_) => value.descriptor(),
            _ => declared.clone(),
        })
        .collect();

    let class = lease.object.class();
    let target = class.find_method(method, &arg_types).ok_or_else(|| {
        let names: Vec<&str> = arg_types.iter().map(TypeDescriptor::name).collect();
        RemotingError::dispatch(format!(
            "{} has no method {}({})",
            class.name(),
            method,
            names.join(", ")
        ))
    })?;

    let policy = lease.policy.access_policy(method)?;
    let reply = target
        .invoke(&lease.object, args)
        .await
        .map_err(RemotingError::Remote)?;
    Ok((reply, policy))
}

/// Lease ids created on behalf of one connection
#[derive(Debug, Default)]
pub(crate) struct LeaseTracker {
    ids: Mutex<Vec<i32>>,
}

impl LeaseTracker {
    fn lease(&self, registry: &Registry, object: &Exposed, policy: Arc<dyn AccessPolicy>) -> Arc<Lease> {
        let (lease, created) = registry.lease_entry(object, policy);
        if created {
            lock(&self.ids).push(lease.id);
        }
        lease
    }

    fn release_all(&self, registry: &Registry) -> usize {
        let ids = std::mem::take(&mut *lock(&self.ids));
        ids.into_iter().filter(|id| registry.release(*id)).count()
    }
}

/// Marshal of the serving end of a binary connection
struct ServerMarshal {
    registry: Arc<Registry>,
    tracker: Arc<LeaseTracker>,
    relay: Arc<CallbackRelay>,
    sink: Weak<dyn EventSink>,
}

impl Marshal for ServerMarshal {
    fn export_object(&self, object: &ObjectRef) -> Result<(i32, TypeDescriptor)> {
        match object {
            ObjectRef::Exposed(exposed) => {
                let lease = self.tracker.lease(&self.registry, exposed, Allowed::shared());
                Ok((lease.id, exposed.descriptor().clone()))
            }
            ObjectRef::Proxy(proxy) => Err(ProtocolError::Unsupported(format!(
                "cannot pass on proxy {} received from another server",
                proxy.id()
            ))
            .into()),
        }
    }

    fn import_object(&self, id: i32, _descriptor: TypeDescriptor) -> Result<ObjectRef> {
        import_lease(&self.registry, id)
    }

    fn export_callback(&self, callback: &Callback) -> Result<i32> {
        self.relay.export(callback)
    }

    fn import_callback(&self, id: i32, descriptor: TypeDescriptor) -> Result<Callback> {
        Ok(self.relay.stub(id, descriptor, self.sink.clone()))
    }

    fn universe(&self) -> &TypeUniverse {
        self.registry.universe()
    }
}

pub(crate) fn import_lease(registry: &Registry, id: i32) -> Result<ObjectRef> {
    registry
        .try_resolve_by_id(id)
        .map(|lease| ObjectRef::Exposed(lease.object.clone()))
        .ok_or_else(|| RemotingError::dispatch(format!("unknown object id {}", id)))
}

/// Marshal that leases outgoing objects with a narrowed policy
pub(crate) struct ScopedMarshal<'a> {
    pub(crate) base: &'a dyn Marshal,
    pub(crate) registry: &'a Registry,
    pub(crate) tracker: Option<&'a LeaseTracker>,
    pub(crate) policy: Arc<dyn AccessPolicy>,
}

impl Marshal for ScopedMarshal<'_> {
    fn export_object(&self, object: &ObjectRef) -> Result<(i32, TypeDescriptor)> {
        match object {
            ObjectRef::Exposed(exposed) => {
                let policy = Arc::clone(&self.policy);
                let lease = match self.tracker {
                    Some(tracker) => tracker.lease(self.registry, exposed, policy),
                    None => self.registry.register(exposed, policy),
                };
                Ok((lease.id, exposed.descriptor().clone()))
            }
            proxy => self.base.export_object(proxy),
        }
    }

    fn import_object(&self, id: i32, descriptor: TypeDescriptor) -> Result<ObjectRef> {
        self.base.import_object(id, descriptor)
    }

    fn export_callback(&self, callback: &Callback) -> Result<i32> {
        self.base.export_callback(callback)
    }

    fn import_callback(&self, id: i32, descriptor: TypeDescriptor) -> Result<Callback> {
        self.base.import_callback(id, descriptor)
    }

    fn universe(&self) -> &TypeUniverse {
        self.base.universe()
    }
}

/// Serving end of one binary connection
pub struct ServerConnection {
    session: Arc<Session>,
    registry: Arc<Registry>,
    tracker: Arc<LeaseTracker>,
    release_on_disconnect: bool,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("session", &self.session.id())
            .field("release_on_disconnect", &self.release_on_disconnect)
            .finish()
    }
}

impl ServerConnection {
    /// Set up the connection over a byte stream pair
    pub async fn accept<R, W>(
        reader: R,
        writer: W,
        registry: Arc<Registry>,
        config: &ServerConfig,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mux = Multiplexer::new(reader, writer, config.mux.clone());
        let channels = SessionChannels::open(mux).await?;
        let tracker = Arc::new(LeaseTracker::default());

        let session = Session::new(channels, |ctx| {
            Box::new(ServerMarshal {
                registry: Arc::clone(&registry),
                tracker: Arc::clone(&tracker),
                relay: ctx.relay,
                sink: ctx.sink,
            })
        });
        session.start();

        Ok(Self {
            session,
            registry,
            tracker,
            release_on_disconnect: config.release_leases_on_disconnect,
        })
    }

    /// Id of the connection
    pub fn session_id(&self) -> Uuid {
        self.session.id()
    }

    /// Serve commands until the peer disconnects
    pub async fn run(self) -> Result<()> {
        let span = tracing::info_span!("connection", session = %self.session.id());
        async move {
            info!("Serving connection");
            let outcome = self.serve().await;
            self.finish().await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn serve(&self) -> Result<()> {
        let mut commands = self.session.commands().clone();

        loop {
            let tag = match commands.read_u8().await {
                Ok(tag) => tag,
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let handled = match Command::try_from(tag) {
                Ok(Command::Get) => self.handle_get(&mut commands).await,
                Ok(Command::Call) => self.handle_call(&mut commands).await,
                Ok(other) => {
                    warn!(command = ?other, "Ignoring unhandled command");
                    Ok(())
                }
                Err(e) => {
                    warn!("Ignoring unknown command byte: {}", e);
                    Ok(())
                }
            };

            match handled {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => {
                    error!("Connection failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn finish(&self) {
        if self.release_on_disconnect {
            let released = self.tracker.release_all(&self.registry);
            debug!(released, "Released connection leases");
        }
        self.session.shutdown().await;
        info!("Connection closed");
    }

    fn scoped(&self, policy: Arc<dyn AccessPolicy>) -> ScopedMarshal<'_> {
        ScopedMarshal {
            base: self.session.marshal(),
            registry: &self.registry,
            tracker: Some(&self.tracker),
            policy,
        }
    }

    async fn handle_get(&self, commands: &mut Channel) -> Result<()> {
        let name = commands.read_string().await?;
        debug!(name = %name, "Get");

        let serializer = self.session.binary();
        let response = match self.registry.root(&name) {
            Some(object) => serializer.encode_get_result(&Value::from(object)),
            None => Err(RemotingError::dispatch(format!("no object named '{}'", name))),
        };
        self.respond(serializer, response).await
    }

    async fn handle_call(&self, commands: &mut Channel) -> Result<()> {
        let serializer = self.session.binary();
        let call = match serializer.decode_call(commands).await {
            Ok(call) => call,
            Err(e) if e.is_disconnect() => return Err(e),
            Err(e) => {
                warn!("Malformed call: {}", e);
                return self.respond(serializer, Err(e)).await;
            }
        };

        let CallMessage {
            target,
            method,
            signature,
            args,
        } = call;
        debug!(target, method = %method, args = args.len(), "Call");

        let response = match self.registry.try_resolve_by_id(target) {
            Some(lease) => match invoke_lease(&lease, &method, &signature, args).await {
                Ok((reply, policy)) => {
                    let scoped = self.scoped(policy);
                    BinarySerializer::new(&scoped).encode_call_result(&reply)
                }
                Err(e) => Err(e),
            },
            None => Err(RemotingError::dispatch(format!("unknown object id {}", target))),
        };

        if let Err(e) = &response {
            debug!(target, method = %method, "Call failed: {}", e);
        }
        self.respond(serializer, response).await
    }

    /// Write a response, turning a failure into an `Exception` message
    async fn respond(
        &self,
        serializer: BinarySerializer<'_>,
        response: Result<remoting_proto::WireWriter>,
    ) -> Result<()> {
        let message = match response {
            Ok(message) => message,
            Err(e) => serializer.encode_exception(&e.to_exception())?,
        };
        self.session.commands().write(&message.freeze()).await?;
        Ok(())
    }
}
