//! Multiplexed connection shared by both ends
//!
//! A session owns the two logical channels of a binary connection:
//! `Commands` carries requests and responses, `Events` carries callback
//! invocations in both directions. Each end runs one event listener that
//! executes incoming invocations against its exported callbacks.

use crate::binary::BinarySerializer;
use crate::callback::{CallbackRelay, EventSink};
use crate::marshal::Marshal;
use crate::value::Args;
use crate::Result;
use async_trait::async_trait;
use remoting_proto::{
    ByteSource, Channel, Command, Multiplexer, COMMANDS_CHANNEL, EVENTS_CHANNEL,
};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

/// What a role-specific [`Marshal`] gets to build itself with
pub struct MarshalContext {
    /// Session id
    pub id: Uuid,
    /// Callback indices of the session
    pub relay: Arc<CallbackRelay>,
    /// Sink that stubs created by this session send through
    pub sink: Weak<dyn EventSink>,
}

/// Channels of a connection, opened before the session is assembled
pub struct SessionChannels {
    mux: Multiplexer,
    commands: Channel,
    events: Channel,
}

impl SessionChannels {
    /// Open `Commands` and `Events` on a multiplexer
    pub async fn open(mux: Multiplexer) -> Result<Self> {
        let commands = mux.open_channel(COMMANDS_CHANNEL).await?;
        let events = mux.open_channel(EVENTS_CHANNEL).await?;
        Ok(Self {
            mux,
            commands,
            events,
        })
    }
}

/// One end of a binary connection
pub struct Session {
    id: Uuid,
    mux: Multiplexer,
    commands: Channel,
    events: Channel,
    /// Serializes whole event messages on the shared `Events` channel
    event_lock: tokio::sync::Mutex<()>,
    relay: Arc<CallbackRelay>,
    marshal: Box<dyn Marshal>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("marker", &self.mux.marker())
            .field("relay", &self.relay)
            .finish()
    }
}

impl Session {
    /// Assemble a session; `build` creates the marshal for this end
    pub fn new<F>(channels: SessionChannels, build: F) -> Arc<Self>
    where
        F: FnOnce(MarshalContext) -> Box<dyn Marshal>,
    {
        let id = Uuid::new_v4();
        let relay = Arc::new(CallbackRelay::new());

        Arc::new_cyclic(|weak: &Weak<Session>| {
            let sink: Weak<dyn EventSink> = weak.clone();
            let marshal = build(MarshalContext {
                id,
                relay: Arc::clone(&relay),
                sink,
            });

            Self {
                id,
                mux: channels.mux,
                commands: channels.commands,
                events: channels.events,
                event_lock: tokio::sync::Mutex::new(()),
                relay,
                marshal,
                listener: Mutex::new(None),
            }
        })
    }

    /// Start the event listener
    pub fn start(self: &Arc<Self>) {
        let span = tracing::debug_span!("events", session = %self.id, marker = %self.mux.marker());
        let task = tokio::spawn(run_event_listener(Arc::downgrade(self), self.events.clone()).instrument(span));
        if let Some(previous) = crate::lock(&self.listener).replace(task) {
            previous.abort();
        }
        info!(session = %self.id, marker = %self.mux.marker(), "Session started");
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The `Commands` channel
    pub fn commands(&self) -> &Channel {
        &self.commands
    }

    /// Callback indices of this connection
    pub fn relay(&self) -> &Arc<CallbackRelay> {
        &self.relay
    }

    /// Marshal of this end
    pub fn marshal(&self) -> &dyn Marshal {
        self.marshal.as_ref()
    }

    /// Binary serializer bound to this end's marshal
    pub fn binary(&self) -> BinarySerializer<'_> {
        BinarySerializer::new(self.marshal.as_ref())
    }

    /// Whether the connection has ended
    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Wait until the connection ends
    pub async fn closed(&self) {
        self.mux.closed().await
    }

    /// Close the connection
    pub async fn shutdown(&self) {
        if let Some(task) = crate::lock(&self.listener).take() {
            task.abort();
        }
        self.mux.shutdown().await;
        debug!(session = %self.id, "Session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = crate::lock(&self.listener).take() {
            task.abort();
        }
        if !self.mux.is_closed() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let mux = self.mux.clone();
                handle.spawn(async move { mux.shutdown().await });
            }
        }
    }
}

#[async_trait]
impl EventSink for Session {
    async fn send_event(&self, id: i32, args: Args) -> Result<()> {
        let message = self.binary().encode_event(id, &args)?.freeze();
        let _guard = self.event_lock.lock().await;
        trace!(session = %self.id, id, bytes = message.len(), "Sending event");
        self.events.write(&message).await?;
        Ok(())
    }
}

async fn run_event_listener(session: Weak<Session>, mut events: Channel) {
    loop {
        let tag = match events.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.is_disconnect() => break,
            Err(e) => {
                warn!("Event channel failed: {}", e);
                break;
            }
        };

        let Some(session) = session.upgrade() else {
            break;
        };

        match Command::try_from(tag) {
            Ok(Command::Event) => match session.binary().decode_event(&mut events).await {
                Ok((id, args)) => {
                    trace!(id, args = args.len(), "Received event");
                    if let Err(e) = session.relay.dispatch(id, args).await {
                        warn!(id, "Event was not delivered: {}", e);
                    }
                }
                Err(e) if e.is_disconnect() => break,
                Err(e) => {
                    warn!("Dropping malformed event: {}", e);
                    break;
                }
            },
            Ok(other) => warn!(command = ?other, "Unexpected command on the event channel"),
            Err(e) => warn!("Unexpected byte on the event channel: {}", e),
        }
    }
    debug!("Event listener stopped");
}

#[cfg(test)]
mod tests;
