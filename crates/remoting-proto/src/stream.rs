//! Channel multiplexing over a single physical stream

use crate::codec::{FrameCodec, MAX_FRAME_SIZE};
use crate::frame::{channel_hash, Frame, MuxCommand};
use crate::ProtocolError;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Default size of a single packet block
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Multiplexer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Largest payload written in one packet frame
    pub packet_size: usize,
    /// Flush the physical stream after every frame
    pub auto_flush: bool,
    /// Largest payload accepted from the peer
    pub max_frame_size: usize,
    /// Label used in log output to tell the two ends apart
    pub marker: String,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            auto_flush: true,
            max_frame_size: MAX_FRAME_SIZE,
            marker: String::from("mux"),
        }
    }
}

impl MuxConfig {
    /// Set the packet block size
    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size.max(1);
        self
    }

    /// Set the log marker
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    /// Enable or disable flushing after every frame
    pub fn with_auto_flush(mut self, auto_flush: bool) -> Self {
        self.auto_flush = auto_flush;
        self
    }
}

/// Receive side of one logical channel
#[derive(Debug, Default)]
struct ChannelState {
    /// Bytes received but not yet read
    buffer: Mutex<BytesMut>,
    /// Wakes readers when bytes arrive or the channel closes
    notify: Notify,
    /// Set once the channel is destroyed or the connection ends
    closed: std::sync::atomic::AtomicBool,
}

impl ChannelState {
    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Release);
        self.notify.notify_waiters();
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Shared {
    /// Open channels by hash
    channels: Mutex<HashMap<u32, Arc<ChannelState>>>,
    /// Physical write half; holding it serializes whole frames
    writer: Mutex<BoxedWriter>,
    /// Encoder for outgoing frames
    codec: FrameCodec,
    config: MuxConfig,
    /// Flips to true when the reader loop ends
    closed_tx: watch::Sender<bool>,
    /// Reader loop task
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Stream multiplexer splitting one byte stream into named channels.
///
/// Cloning is cheap and every clone refers to the same connection.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    /// Wrap a physical stream and start the demultiplexing loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W, config: MuxConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            channels: Mutex::new(HashMap::new()),
            writer: Mutex::new(Box::new(writer)),
            codec: FrameCodec::with_max_frame_size(config.max_frame_size),
            config,
            closed_tx,
            reader_task: std::sync::Mutex::new(None),
        });

        let mux = Self { shared };
        let task = tokio::spawn(mux.clone().run_reader(reader));
        if let Ok(mut slot) = mux.shared.reader_task.lock() {
            *slot = Some(task);
        }

        mux
    }

    /// Get the configured log marker
    pub fn marker(&self) -> &str {
        &self.shared.config.marker
    }

    /// Open a channel by name, announcing it to the peer on first use.
    ///
    /// Opening an already open channel returns a handle to the same queue.
    pub async fn open_channel(&self, name: &str) -> Result<Channel, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ChannelClosed);
        }

        let hash = channel_hash(name);

        // The writer lock is held across the table update so no packet for
        // this channel can reach the wire before its announcement.
        let mut writer = self.shared.writer.lock().await;
        let state = {
            let mut channels = self.shared.channels.lock().await;
            if let Some(state) = channels.get(&hash) {
                return Ok(self.handle(name, hash, Arc::clone(state)));
            }

            let state = Arc::new(ChannelState::default());
            channels.insert(hash, Arc::clone(&state));
            state
        };

        debug!(marker = %self.marker(), channel = name, hash, "Opening channel");
        self.shared
            .codec
            .write_frame(&mut *writer, &Frame::create(hash), self.shared.config.auto_flush)
            .await?;

        Ok(self.handle(name, hash, state))
    }

    fn handle(&self, name: &str, hash: u32, state: Arc<ChannelState>) -> Channel {
        Channel {
            name: name.to_string(),
            hash,
            state,
            mux: self.clone(),
        }
    }

    /// Route an incoming frame to its channel
    pub async fn route_frame(&self, frame: Frame) -> Result<(), ProtocolError> {
        trace!(
            marker = %self.marker(),
            command = ?frame.command,
            channel = frame.channel,
            len = frame.payload.len(),
            "Received frame"
        );

        let mut channels = self.shared.channels.lock().await;

        match frame.command {
            MuxCommand::CreateCanal => {
                channels.entry(frame.channel).or_default();
            }
            MuxCommand::DestroyCanal => {
                if let Some(state) = channels.remove(&frame.channel) {
                    state.close();
                }
            }
            MuxCommand::Packet => {
                let state = channels
                    .get(&frame.channel)
                    .cloned()
                    .ok_or(ProtocolError::UnknownChannel(frame.channel))?;
                drop(channels);

                state.buffer.lock().await.extend_from_slice(&frame.payload);
                state.notify.notify_waiters();
            }
        }

        Ok(())
    }

    /// Get the number of open channels
    pub async fn channel_count(&self) -> usize {
        self.shared.channels.lock().await.len()
    }

    /// Whether the reader loop has ended
    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    /// Wait until the reader loop ends
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        // The sender lives in `self`, so this only errors after the value flipped
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Stop the reader loop, close every channel and shut the write half down
    pub async fn shutdown(&self) {
        let task = self
            .shared
            .reader_task
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(task) = task {
            task.abort();
        }

        self.close_all().await;

        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(marker = %self.marker(), "Write half shutdown failed: {}", e);
        }
    }

    async fn close_all(&self) {
        let mut channels = self.shared.channels.lock().await;
        for (_, state) in channels.drain() {
            state.close();
        }
        self.shared.closed_tx.send_replace(true);
    }

    async fn run_reader<R>(self, mut reader: R)
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut codec = FrameCodec::with_max_frame_size(self.shared.config.max_frame_size);
        debug!(marker = %self.marker(), "Starting demultiplexer");

        loop {
            match codec.read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if let Err(e) = self.route_frame(frame).await {
                        warn!(marker = %self.marker(), "Dropping frame: {}", e);
                    }
                }
                Ok(None) => {
                    debug!(marker = %self.marker(), "Physical stream closed");
                    break;
                }
                Err(e) => {
                    error!(marker = %self.marker(), "Failed to read frame: {}", e);
                    break;
                }
            }
        }

        self.close_all().await;
        debug!(marker = %self.marker(), "Demultiplexer stopped");
    }

    async fn write_packets(&self, hash: u32, data: &[u8]) -> Result<(), ProtocolError> {
        for block in data.chunks(self.shared.config.packet_size.max(1)) {
            let frame = Frame::packet(hash, Bytes::copy_from_slice(block));

            let mut writer = self.shared.writer.lock().await;
            self.shared
                .codec
                .write_frame(&mut *writer, &frame, self.shared.config.auto_flush)
                .await?;
        }

        Ok(())
    }

    async fn destroy_channel(&self, hash: u32) -> Result<(), ProtocolError> {
        let mut writer = self.shared.writer.lock().await;

        if let Some(state) = self.shared.channels.lock().await.remove(&hash) {
            state.close();
        }

        self.shared
            .codec
            .write_frame(&mut *writer, &Frame::destroy(hash), self.shared.config.auto_flush)
            .await
    }
}

/// Handle to one logical channel
#[derive(Clone)]
pub struct Channel {
    name: String,
    hash: u32,
    state: Arc<ChannelState>,
    mux: Multiplexer,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .field("closed", &self.state.is_closed())
            .finish()
    }
}

impl Channel {
    /// Get the channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the channel wire hash
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Whether the channel was destroyed or the connection ended
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Write bytes to the peer's side of this channel
    pub async fn write(&self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.state.is_closed() {
            return Err(ProtocolError::ChannelClosed);
        }
        self.mux.write_packets(self.hash, data).await
    }

    /// Read exactly `n` bytes, waiting until they arrive
    pub async fn read_exact(&self, n: usize) -> Result<Bytes, ProtocolError> {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut buffer = self.state.buffer.lock().await;
                if buffer.len() >= n {
                    return Ok(buffer.split_to(n).freeze());
                }
                if self.state.is_closed() {
                    return Err(ProtocolError::ChannelClosed);
                }
            }

            notified.await;
        }
    }

    /// Number of bytes buffered and ready to read
    pub async fn available(&self) -> usize {
        self.state.buffer.lock().await.len()
    }

    /// Destroy the channel on both ends
    pub async fn close(&self) -> Result<(), ProtocolError> {
        debug!(marker = %self.mux.marker(), channel = %self.name, "Closing channel");
        self.mux.destroy_channel(self.hash).await
    }
}
