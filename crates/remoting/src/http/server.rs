use super::{SESSION_HEADER, XML_CONTENT_TYPE};
use crate::callback::{Callback, CallbackRelay, EventSink};
use crate::config::ServerConfig;
use crate::marshal::Marshal;
use crate::object::ObjectRef;
use crate::registry::Registry;
use crate::server::{import_lease, invoke_lease, ScopedMarshal};
use crate::types::TypeUniverse;
use crate::value::{Args, Value};
use crate::xml::XmlSerializer;
use crate::{lock, RemotingError, Result};
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use remoting_proto::{ProtocolError, TypeDescriptor};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Server state of one HTTP client.
///
/// Holds the stubs of the client's callbacks and the invocations waiting to
/// be fetched.
struct HttpSession {
    id: Uuid,
    registry: Arc<Registry>,
    relay: CallbackRelay,
    sink: Weak<dyn EventSink>,
    queues: Mutex<HashMap<i32, VecDeque<Args>>>,
    arrived: Notify,
}

impl HttpSession {
    fn new(id: Uuid, registry: Arc<Registry>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<HttpSession>| {
            let sink: Weak<dyn EventSink> = weak.clone();
            Self {
                id,
                registry,
                relay: CallbackRelay::new(),
                sink,
                queues: Mutex::new(HashMap::new()),
                arrived: Notify::new(),
            }
        })
    }

    fn take(&self, id: i32) -> Vec<Args> {
        lock(&self.queues)
            .get_mut(&id)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Wait up to `wait` for invocations of callback `id`
    async fn next_batch(&self, id: i32, wait: Duration) -> Vec<Args> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take(id);
            if !batch.is_empty() {
                return batch;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }
}

#[async_trait]
impl EventSink for HttpSession {
    async fn send_event(&self, id: i32, args: Args) -> Result<()> {
        trace!(session = %self.id, id, "Queueing callback invocation");
        lock(&self.queues).entry(id).or_default().push_back(args);
        self.arrived.notify_waiters();
        Ok(())
    }
}

impl Marshal for HttpSession {
    fn export_object(&self, object: &ObjectRef) -> Result<(i32, TypeDescriptor)> {
        match object {
            ObjectRef::Exposed(exposed) => {
                let lease = self.registry.try_resolve_by_identity(exposed);
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

    fn export_callback(&self, _callback: &Callback) -> Result<i32> {
        Err(ProtocolError::Unsupported("an HTTP server cannot send callbacks to its clients".into()).into())
    }

    fn import_callback(&self, id: i32, descriptor: TypeDescriptor) -> Result<Callback> {
        Ok(self.relay.stub(id, descriptor, self.sink.clone()))
    }

    fn universe(&self) -> &TypeUniverse {
        self.registry.universe()
    }
}

struct HttpState {
    registry: Arc<Registry>,
    sessions: Mutex<HashMap<Uuid, Arc<HttpSession>>>,
    callback_wait: Duration,
}

impl HttpState {
    fn session(&self, headers: &HeaderMap) -> Arc<HttpSession> {
        let id = headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value).ok())
            .unwrap_or_else(Uuid::nil);

        let mut sessions = lock(&self.sessions);
        Arc::clone(sessions.entry(id).or_insert_with(|| {
            debug!(session = %id, "New HTTP session");
            HttpSession::new(id, Arc::clone(&self.registry))
        }))
    }
}

fn xml(body: String) -> Response {
    ([(header::CONTENT_TYPE, XML_CONTENT_TYPE)], body).into_response()
}

fn bad_request(err: RemotingError) -> Response {
    let text = match err {
        RemotingError::Dispatch(msg) => msg,
        other => other.to_string(),
    };
    debug!("Rejecting request: {}", text);
    (StatusCode::BAD_REQUEST, text).into_response()
}

async fn get_object(
    State(state): State<Arc<HttpState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let session = state.session(&headers);
    let Some(object) = state.registry.root(&name) else {
        return bad_request(RemotingError::dispatch(format!("no object named '{}'", name)));
    };

    debug!(session = %session.id, name = %name, "Get");
    match XmlSerializer::new(&*session).encode_get_result(&Value::from(object)) {
        Ok(body) => xml(body),
        Err(e) => bad_request(e),
    }
}

async fn call(
    State(state): State<Arc<HttpState>>,
    Path(target): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let session = state.session(&headers);
    let serializer = XmlSerializer::new(&*session);

    let Ok(target) = target.parse::<i32>() else {
        return bad_request(RemotingError::dispatch(format!("'{}' is not an object id", target)));
    };
    let Some(lease) = state.registry.try_resolve_by_id(target) else {
        return bad_request(RemotingError::dispatch(format!("unknown object id {}", target)));
    };
    let call = match serializer.decode_call(&body) {
        Ok(call) => call,
        Err(e) => return bad_request(e),
    };

    debug!(session = %session.id, target, method = %call.method, "Call");
    let response = match invoke_lease(&lease, &call.method, &call.signature, call.args).await {
        Ok((reply, policy)) => {
            let scoped = ScopedMarshal {
                base: &*session,
                registry: &state.registry,
                tracker: None,
                policy,
            };
            XmlSerializer::new(&scoped).encode_response(&reply)
        }
        Err(e) => Err(e),
    };

    xml(response.unwrap_or_else(|e| {
        debug!(target, method = %call.method, "Call failed: {}", e);
        serializer.encode_exception(&e.to_exception())
    }))
}

async fn poll_callback(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<i32>,
    headers: HeaderMap,
) -> Response {
    let session = state.session(&headers);
    let batch = session.next_batch(id, state.callback_wait).await;
    if !batch.is_empty() {
        trace!(session = %session.id, id, count = batch.len(), "Delivering callback invocations");
    }

    match XmlSerializer::new(&*session).encode_invocations(&batch) {
        Ok(body) => xml(body),
        Err(e) => bad_request(e),
    }
}

/// Serves a registry over HTTP
pub struct HttpServer {
    state: Arc<HttpState>,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    running: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl HttpServer {
    /// Bind the listener at `config.host:config.http_port`
    pub async fn bind(config: ServerConfig, registry: Arc<Registry>) -> Result<Self> {
        let listener = TcpListener::bind(config.http_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "HTTP listener bound");

        Ok(Self {
            state: Arc::new(HttpState {
                registry,
                sessions: Mutex::new(HashMap::new()),
                callback_wait: config.callback_wait(),
            }),
            local_addr,
            listener: Mutex::new(Some(listener)),
            running: Mutex::new(None),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL clients connect to
    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Registry served by this server
    pub fn registry(&self) -> &Arc<Registry> {
        &self.state.registry
    }

    /// Whether the server is running
    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Start serving in the background.
    ///
    /// Starting twice, or after [`HttpServer::stop`], does nothing.
    pub fn start(&self) {
        let Some(listener) = lock(&self.listener).take() else {
            warn!(port = self.local_addr.port(), "HTTP server already started");
            return;
        };

        let app = Router::new()
            .route("/Callback/:id", get(poll_callback))
            .route("/:key", get(get_object).post(call))
            .with_state(Arc::clone(&self.state));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                error!("HTTP server failed: {}", e);
            }
        });
        *lock(&self.running) = Some((shutdown_tx, task));
        info!(port = self.local_addr.port(), "HTTP server started");
    }

    /// Stop serving.
    ///
    /// Pending callback polls are cut off rather than drained.
    pub async fn stop(&self) {
        let Some((shutdown_tx, task)) = lock(&self.running).take() else {
            return;
        };
        let _ = shutdown_tx.send(());
        task.abort();
        let _ = task.await;
        info!(port = self.local_addr.port(), "HTTP server stopped");
    }
}

impl fmt::Display for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HttpServer {{ Port: {} }}", self.local_addr.port())
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}
