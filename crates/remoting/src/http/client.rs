use super::{SESSION_HEADER, XML_CONTENT_TYPE};
use crate::callback::{Callback, CallbackRelay};
use crate::client::{export_proxy, Dispatcher, FromProxy, Proxy, ProxyCache};
use crate::config::ClientConfig;
use crate::marshal::Marshal;
use crate::object::{ObjectRef, Reply};
use crate::types::TypeUniverse;
use crate::value::{Args, Value};
use crate::xml::XmlSerializer;
use crate::{lock, RemotingError, Result};
use async_trait::async_trait;
use remoting_proto::{names, ProtocolError, TypeDescriptor};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

struct HttpCore {
    base_url: String,
    http: reqwest::Client,
    session_id: Uuid,
    relay: Arc<CallbackRelay>,
    proxies: ProxyCache,
    universe: Arc<TypeUniverse>,
    /// One long-poll task per exported callback
    pollers: Mutex<HashMap<i32, JoinHandle<()>>>,
    config: ClientConfig,
    this: Weak<HttpCore>,
}

impl HttpCore {
    fn url(&self, path: impl fmt::Display) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Url of a published object, the name encoded as one path segment
    fn object_url(&self, name: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| RemotingError::Http(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| RemotingError::Http(format!("{} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .push(name);
        Ok(url)
    }

    async fn read_body(response: reqwest::Response) -> Result<String> {
        let status = response.status();
        let body = response.text().await?;
        if status == StatusCode::BAD_REQUEST {
            return Err(RemotingError::Dispatch(body));
        }
        if !status.is_success() {
            return Err(RemotingError::Http(format!("{}: {}", status, body)));
        }
        Ok(body)
    }

    async fn fetch_invocations(&self, id: i32) -> Result<Vec<Args>> {
        let response = self
            .http
            .get(self.url(format!("Callback/{}", id)))
            .header(SESSION_HEADER, self.session_id.to_string())
            .send()
            .await?;
        let body = Self::read_body(response).await?;
        XmlSerializer::new(self).decode_invocations(&body)
    }

    fn ensure_poller(&self, id: i32) {
        let mut pollers = lock(&self.pollers);
        if pollers.contains_key(&id) {
            return;
        }
        debug!(id, "Starting callback poller");
        pollers.insert(id, tokio::spawn(poll_callback(self.this.clone(), id)));
    }

    fn stop_pollers(&self) {
        for (_, poller) in lock(&self.pollers).drain() {
            poller.abort();
        }
    }
}

impl Drop for HttpCore {
    fn drop(&mut self) {
        self.stop_pollers();
    }
}

/// Fetch and run the invocations of one callback until the client goes away
async fn poll_callback(weak: Weak<HttpCore>, id: i32) {
    loop {
        let Some(core) = weak.upgrade() else {
            break;
        };

        match core.fetch_invocations(id).await {
            Ok(batch) => {
                for args in batch {
                    if let Err(e) = core.relay.dispatch(id, args).await {
                        warn!(id, "Callback invocation failed: {}", e);
                    }
                }
            }
            Err(e) => {
                debug!(id, "Callback poll failed: {}", e);
                let pause = core.config.callback_poll_interval();
                drop(core);
                tokio::time::sleep(pause).await;
            }
        }
    }
    trace!(id, "Callback poller finished");
}

impl Marshal for HttpCore {
    fn export_object(&self, object: &ObjectRef) -> Result<(i32, TypeDescriptor)> {
        export_proxy(self.session_id, object)
    }

    fn import_object(&self, id: i32, descriptor: TypeDescriptor) -> Result<ObjectRef> {
        let core = self.this.upgrade().ok_or(RemotingError::ConnectionClosed)?;
        Ok(ObjectRef::Proxy(self.proxies.get_or_create(id, descriptor, core)))
    }

    fn export_callback(&self, callback: &Callback) -> Result<i32> {
        let id = self.relay.export(callback)?;
        self.ensure_poller(id);
        Ok(id)
    }

    fn import_callback(&self, id: i32, _descriptor: TypeDescriptor) -> Result<Callback> {
        Err(ProtocolError::Unsupported(format!(
            "HTTP server sent callback {} it cannot invoke",
            id
        ))
        .into())
    }

    fn universe(&self) -> &TypeUniverse {
        &self.universe
    }
}

#[async_trait]
impl Dispatcher for HttpCore {
    async fn get_object(&self, name: &str) -> Result<Proxy> {
        let response = self
            .http
            .get(self.object_url(name)?)
            .header(SESSION_HEADER, self.session_id.to_string())
            .send()
            .await?;
        let body = Self::read_body(response).await?;

        match XmlSerializer::new(self).decode_get_result(&body)? {
            Value::Object(ObjectRef::Proxy(proxy)) => Ok(proxy),
            other => Err(RemotingError::TypeMismatch {
                expected: names::REMOTE_OBJECT.to_string(),
                found: other.type_name(),
            }),
        }
    }

    async fn invoke(&self, target: &Proxy, method: &str, args: Args) -> Result<Reply> {
        let serializer = XmlSerializer::new(self);
        let request = serializer.encode_call(method, &args)?;

        let response = self
            .http
            .post(self.url(target.id()))
            .header(SESSION_HEADER, self.session_id.to_string())
            .header(CONTENT_TYPE, XML_CONTENT_TYPE)
            .body(request)
            .send()
            .await?;
        let body = Self::read_body(response).await?;
        serializer.decode_response(&body)
    }

    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn universe(&self) -> &TypeUniverse {
        &self.universe
    }
}

/// Client of an [`HttpServer`](super::HttpServer).
///
/// Every call is an independent request, so calls from several tasks run
/// concurrently. Callbacks passed to the server are delivered by a background
/// long-poll per callback, started when the callback is first sent.
#[derive(Clone)]
pub struct HttpClient {
    core: Arc<HttpCore>,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.core.base_url)
            .field("session", &self.core.session_id)
            .finish()
    }
}

impl HttpClient {
    /// Client for the server at `base_url`, e.g. `http://127.0.0.1:8080`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_config(base_url, ClientConfig::default())
    }

    /// Client with explicit settings
    pub fn with_config(base_url: impl Into<String>, config: ClientConfig) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder().build()?;
        let session_id = Uuid::new_v4();
        info!(session = %session_id, base_url = %base_url, "HTTP client created");

        let core = Arc::new_cyclic(|this: &Weak<HttpCore>| HttpCore {
            base_url,
            http,
            session_id,
            relay: Arc::new(CallbackRelay::new()),
            proxies: ProxyCache::default(),
            universe: Arc::new(TypeUniverse::new()),
            pollers: Mutex::new(HashMap::new()),
            config,
            this: this.clone(),
        });
        Ok(Self { core })
    }

    /// Server this client talks to
    pub fn base_url(&self) -> &str {
        &self.core.base_url
    }

    /// Resolve a published object by name
    pub async fn get_object(&self, name: &str) -> Result<Proxy> {
        self.core.get_object(name).await
    }

    /// Resolve a published object as a typed stand-in
    pub async fn get_typed<T: FromProxy>(&self, name: &str) -> Result<T> {
        self.get_object(name).await?.into_typed()
    }

    /// Types known on this side
    pub fn universe(&self) -> &Arc<TypeUniverse> {
        &self.core.universe
    }

    /// The client as a [`Dispatcher`]
    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        self.core.clone()
    }

    /// Callbacks sent to the server
    pub fn relay(&self) -> &Arc<CallbackRelay> {
        &self.core.relay
    }

    /// Id sent with every request
    pub fn session_id(&self) -> Uuid {
        self.core.session_id
    }

    /// Stop delivering callbacks
    pub fn close(&self) {
        self.core.stop_pollers();
    }
}
