//! Stream multiplexer for the tunnel
//!
//! Routes inbound frames to their streams, serializes outbound frames fairly
//! and enforces per-stream credit. The multiplexer is owned by exactly one
//! session driver task; stream endpoints talk to it through a command channel.

use super::{Frame, FrameType, StreamState, StreamTable, TunnelError, TunnelStream};
use crate::protocol::{
    ErrorReason, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_STREAMS,
    DEFAULT_STREAM_WINDOW,
};
use crate::proxy::Address;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, trace, warn};

/// Which end of the tunnel this multiplexer serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens streams towards the relay
    Client,
    /// Accepts streams and dials their destinations
    Relay,
}

/// Multiplexer limits
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Maximum number of live streams
    pub max_streams: usize,
    /// Per-stream receive window, and the initial send credit
    pub window: u32,
    /// Maximum frame payload
    pub max_payload: usize,
    /// Largest DATA payload produced by a single send
    pub chunk_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            window: DEFAULT_STREAM_WINDOW,
            max_payload: DEFAULT_MAX_FRAME_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl MuxConfig {
    /// Credit returns in half-window steps, so a chunk above half the
    /// window could wait on credit the peer never hands back
    fn effective_chunk(&self) -> usize {
        self.chunk_size
            .min(self.max_payload)
            .min((self.window / 2) as usize)
            .max(1)
    }
}

/// Stream event sent from multiplexer to stream endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The relay acknowledged the open
    Opened,
    /// Data received for stream
    Data(Bytes),
    /// Stream closed by remote (half-close)
    Close,
    /// Stream failed; no further events follow
    Error(ErrorReason),
}

/// Command sent from stream endpoints to the multiplexer
#[derive(Debug)]
pub enum StreamCommand {
    /// Open new stream to destination (client side)
    Open {
        destination: Address,
        reply: oneshot::Sender<Result<StreamHandle, TunnelError>>,
    },
    /// Send data on stream; credit has already been acquired
    Data { stream_id: u32, data: Bytes },
    /// Half-close the local direction
    Close { stream_id: u32 },
    /// Bytes written to the local socket, eligible to be credited back
    Consumed { stream_id: u32, bytes: usize },
    /// Abort the stream and tell the peer why
    Reset { stream_id: u32, reason: ErrorReason },
    /// Destination dialed, acknowledge the open (relay side)
    Accept { stream_id: u32 },
    /// The endpoint was dropped
    Release { stream_id: u32 },
}

/// Channels the multiplexer holds for a stream's endpoint
#[derive(Debug)]
struct StreamLink {
    events: mpsc::UnboundedSender<StreamEvent>,
    credit: Arc<Semaphore>,
}

impl StreamLink {
    fn notify(&self, event: StreamEvent) {
        // The endpoint may already be gone; its Release command is on the way
        let _ = self.events.send(event);
    }

    fn shutdown(&self, event: Option<StreamEvent>) {
        if let Some(event) = event {
            self.notify(event);
        }
        self.credit.close();
    }
}

/// Outbound frame queues: one control queue plus one FIFO per stream,
/// drained round-robin a frame at a time.
#[derive(Debug, Default)]
struct OutboundScheduler {
    control: VecDeque<Frame>,
    queues: HashMap<u32, VecDeque<Frame>>,
    ready: VecDeque<u32>,
}

impl OutboundScheduler {
    fn push_control(&mut self, frame: Frame) {
        self.control.push_back(frame);
    }

    fn push(&mut self, frame: Frame) {
        let id = frame.stream_id;
        let queue = self.queues.entry(id).or_default();
        if queue.is_empty() {
            self.ready.push_back(id);
        }
        queue.push_back(frame);
    }

    fn pop(&mut self) -> Option<Frame> {
        if let Some(frame) = self.control.pop_front() {
            return Some(frame);
        }
        while let Some(id) = self.ready.pop_front() {
            let Some(queue) = self.queues.get_mut(&id) else {
                // discarded
                continue;
            };
            match queue.pop_front() {
                Some(frame) => {
                    if queue.is_empty() {
                        self.queues.remove(&id);
                    } else {
                        self.ready.push_back(id);
                    }
                    return Some(frame);
                }
                None => {
                    self.queues.remove(&id);
                }
            }
        }
        None
    }

    fn discard(&mut self, id: u32) {
        self.queues.remove(&id);
    }

    fn is_empty(&self) -> bool {
        self.control.is_empty() && self.queues.is_empty()
    }

    fn clear(&mut self) {
        self.control.clear();
        self.queues.clear();
        self.ready.clear();
    }
}

/// Stream multiplexer
pub struct Multiplexer {
    role: Role,
    config: MuxConfig,
    /// Live streams
    streams: StreamTable<StreamLink>,
    /// Frames waiting for the writer
    outbound: OutboundScheduler,
    /// Command sender (cloned into stream endpoints)
    cmd_tx: mpsc::UnboundedSender<StreamCommand>,
    draining: bool,
    last_pong_at: Instant,
    last_inbound_at: Instant,
}

impl Multiplexer {
    /// Create a multiplexer and the receiving end of its command channel
    pub fn new(role: Role, config: MuxConfig) -> (Self, mpsc::UnboundedReceiver<StreamCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let mux = Self {
            role,
            config,
            streams: StreamTable::new(),
            outbound: OutboundScheduler::default(),
            cmd_tx,
            draining: false,
            last_pong_at: now,
            last_inbound_at: now,
        };
        (mux, cmd_rx)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Command channel for code outside the session driver
    pub fn command_sender(&self) -> mpsc::UnboundedSender<StreamCommand> {
        self.cmd_tx.clone()
    }

    /// Get number of live streams
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn last_pong_at(&self) -> Instant {
        self.last_pong_at
    }

    pub fn last_inbound_at(&self) -> Instant {
        self.last_inbound_at
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Stop accepting new streams
    pub fn begin_drain(&mut self) {
        self.draining = true;
    }

    /// No live streams and nothing left to write
    pub fn is_idle(&self) -> bool {
        self.streams.is_empty() && self.outbound.is_empty()
    }

    /// Check if there are frames to send
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Next frame for the writer
    pub fn next_outbound(&mut self) -> Option<Frame> {
        self.outbound.pop()
    }

    /// Queue a keepalive ping
    pub fn queue_ping(&mut self) {
        let nonce: u64 = rand::random();
        self.outbound.push_control(Frame::ping(nonce));
    }

    fn new_link(&self, stream_id: u32, destination: Address) -> (StreamLink, StreamHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(self.config.window as usize));
        let link = StreamLink {
            events: event_tx,
            credit: credit.clone(),
        };
        let handle = StreamHandle {
            destination,
            sender: StreamSender {
                id: stream_id,
                cmd_tx: self.cmd_tx.clone(),
                credit,
                chunk: self.config.effective_chunk(),
            },
            receiver: StreamReceiver {
                id: stream_id,
                cmd_tx: self.cmd_tx.clone(),
                events: event_rx,
                pending: None,
            },
        };
        (link, handle)
    }

    /// Open a new stream to a destination
    pub fn open_stream(&mut self, destination: Address) -> Result<StreamHandle, TunnelError> {
        if self.draining {
            return Err(TunnelError::ShuttingDown);
        }
        if self.streams.len() >= self.config.max_streams {
            return Err(TunnelError::TooManyStreams(self.config.max_streams));
        }
        let stream_id = self.streams.allocate()?;

        let (link, handle) = self.new_link(stream_id, destination.clone());
        self.outbound
            .push(Frame::open(stream_id, destination.encode()));
        self.streams.insert(
            TunnelStream::new(stream_id, destination.clone(), self.config.window),
            link,
        );
        debug!("Stream {} opening to {}", stream_id, destination);
        Ok(handle)
    }

    /// Handle an incoming frame.
    ///
    /// Stream-level problems are answered with an ERROR frame on that stream.
    /// An `Err` means the session itself is broken and must be torn down.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<Option<StreamHandle>, TunnelError> {
        self.last_inbound_at = Instant::now();
        trace!(
            "<- {:?} stream={} len={}",
            frame.frame_type,
            frame.stream_id,
            frame.payload.len()
        );

        match frame.frame_type {
            FrameType::Open => self.handle_open(frame.stream_id, frame.payload),
            FrameType::Data => {
                self.handle_data(frame.stream_id, frame.payload);
                Ok(None)
            }
            FrameType::Close => {
                self.handle_close(frame.stream_id);
                Ok(None)
            }
            FrameType::Error => {
                let (reason, detail) = frame.error_reason();
                self.handle_error(frame.stream_id, reason, &detail);
                Ok(None)
            }
            FrameType::WindowUpdate => {
                let increment = frame.window_increment()?;
                if let Some(slot) = self.streams.get_mut(frame.stream_id) {
                    slot.link.credit.add_permits(increment as usize);
                    slot.stream.set_backpressured(false);
                }
                Ok(None)
            }
            FrameType::Ping => {
                let nonce = frame.keepalive_nonce()?;
                self.outbound.push_control(Frame::pong(nonce));
                Ok(None)
            }
            FrameType::Pong => {
                frame.keepalive_nonce()?;
                self.last_pong_at = Instant::now();
                Ok(None)
            }
        }
    }

    fn handle_open(
        &mut self,
        stream_id: u32,
        payload: Bytes,
    ) -> Result<Option<StreamHandle>, TunnelError> {
        match self.role {
            Role::Client => {
                if !payload.is_empty() {
                    return Err(TunnelError::InvalidFrame(
                        "Relay attempted to open a stream".to_string(),
                    ));
                }
                if let Some(slot) = self.streams.get_mut(stream_id) {
                    if slot.stream.state() == StreamState::Opening {
                        slot.stream.mark_open();
                        slot.link.notify(StreamEvent::Opened);
                        debug!("Stream {} acknowledged", stream_id);
                    }
                }
                Ok(None)
            }
            Role::Relay => {
                if payload.is_empty() {
                    return Err(TunnelError::InvalidFrame(format!(
                        "Empty OPEN on stream {}",
                        stream_id
                    )));
                }
                if self.streams.contains(stream_id) {
                    return Err(TunnelError::InvalidFrame(format!(
                        "Stream ID {} reused",
                        stream_id
                    )));
                }

                let destination = match Address::decode(&payload) {
                    Ok(addr) => addr,
                    Err(e) => {
                        debug!("Stream {} has invalid destination: {}", stream_id, e);
                        self.reject(stream_id, ErrorReason::InvalidDestination, &e.to_string());
                        return Ok(None);
                    }
                };
                if self.draining {
                    self.reject(stream_id, ErrorReason::ShuttingDown, "");
                    return Ok(None);
                }
                if self.streams.len() >= self.config.max_streams {
                    warn!(
                        "Rejecting stream {}: {} streams open",
                        stream_id,
                        self.streams.len()
                    );
                    self.reject(stream_id, ErrorReason::TooManyStreams, "");
                    return Ok(None);
                }

                let (link, handle) = self.new_link(stream_id, destination.clone());
                self.streams.insert_remote(
                    TunnelStream::new(stream_id, destination, self.config.window),
                    link,
                )?;
                Ok(Some(handle))
            }
        }
    }

    fn reject(&mut self, stream_id: u32, reason: ErrorReason, detail: &str) {
        self.outbound.push(Frame::error(stream_id, reason, detail));
    }

    fn handle_data(&mut self, stream_id: u32, data: Bytes) {
        let Some(slot) = self.streams.get_mut(stream_id) else {
            trace!("Dropping DATA for unknown stream {}", stream_id);
            return;
        };

        if self.role == Role::Client && slot.stream.state() == StreamState::Opening {
            slot.stream.mark_open();
            slot.link.notify(StreamEvent::Opened);
        }

        match slot.stream.on_data(data.len()) {
            Ok(()) => slot.link.notify(StreamEvent::Data(data)),
            Err(TunnelError::FlowControlViolation) => {
                warn!("Stream {} exceeded its receive window", stream_id);
                self.reset(stream_id, ErrorReason::FlowControl);
            }
            Err(_) => {
                debug!("DATA after CLOSE on stream {}", stream_id);
                self.reset(stream_id, ErrorReason::ProtocolViolation);
            }
        }
    }

    fn handle_close(&mut self, stream_id: u32) {
        let Some(slot) = self.streams.get_mut(stream_id) else {
            return;
        };
        if slot.stream.close_remote() {
            slot.link.notify(StreamEvent::Close);
        }
        if slot.stream.is_closed() {
            self.remove(stream_id, None);
        }
    }

    fn handle_error(&mut self, stream_id: u32, reason: ErrorReason, detail: &str) {
        if self.streams.contains(stream_id) {
            debug!("Stream {} failed remotely: {} {}", stream_id, reason, detail);
            self.outbound.discard(stream_id);
            self.remove(stream_id, Some(StreamEvent::Error(reason)));
        }
    }

    /// Abort a stream: tell the endpoint and the peer
    fn reset(&mut self, stream_id: u32, reason: ErrorReason) {
        if self.streams.contains(stream_id) {
            self.outbound.discard(stream_id);
            self.outbound.push(Frame::error(stream_id, reason, ""));
            self.remove(stream_id, Some(StreamEvent::Error(reason)));
        }
    }

    fn remove(&mut self, stream_id: u32, event: Option<StreamEvent>) {
        if let Some(slot) = self.streams.remove(stream_id) {
            slot.link.shutdown(event);
            trace!(
                "Stream {} removed after {:?}",
                stream_id,
                slot.stream.created_at().elapsed()
            );
        }
    }

    /// Apply a command from a stream endpoint
    pub fn handle_command(&mut self, cmd: StreamCommand) {
        match cmd {
            StreamCommand::Open { destination, reply } => {
                let result = self.open_stream(destination);
                // A dropped handle resets itself through Release
                let _ = reply.send(result);
            }
            StreamCommand::Data { stream_id, data } => {
                if let Some(slot) = self.streams.get_mut(stream_id) {
                    if slot.stream.can_send() {
                        slot.stream.touch();
                        slot.stream
                            .set_backpressured(slot.link.credit.available_permits() == 0);
                        self.outbound.push(Frame::data(stream_id, data));
                    }
                }
            }
            StreamCommand::Close { stream_id } => {
                if let Some(slot) = self.streams.get_mut(stream_id) {
                    if slot.stream.close_local() {
                        self.outbound.push(Frame::close(stream_id));
                    }
                    if slot.stream.is_closed() {
                        self.remove(stream_id, None);
                    }
                }
            }
            StreamCommand::Consumed { stream_id, bytes } => {
                if let Some(slot) = self.streams.get_mut(stream_id) {
                    if let Some(increment) = slot.stream.on_consumed(bytes) {
                        self.outbound
                            .push_control(Frame::window_update(stream_id, increment));
                    }
                }
            }
            StreamCommand::Reset { stream_id, reason } => {
                if self.streams.contains(stream_id) {
                    debug!("Stream {} reset locally: {}", stream_id, reason);
                    self.outbound.discard(stream_id);
                    self.outbound.push(Frame::error(stream_id, reason, ""));
                    self.remove(stream_id, None);
                }
            }
            StreamCommand::Accept { stream_id } => {
                if let Some(slot) = self.streams.get_mut(stream_id) {
                    slot.stream.mark_open();
                    self.outbound.push(Frame::open_ack(stream_id));
                }
            }
            StreamCommand::Release { stream_id } => {
                if self.streams.contains(stream_id) {
                    debug!("Stream {} dropped without close", stream_id);
                    self.outbound.discard(stream_id);
                    self.outbound
                        .push(Frame::error(stream_id, ErrorReason::Cancelled, ""));
                    self.remove(stream_id, None);
                }
            }
        }
    }

    /// Force-close every stream with `reason`. Returns how many were closed.
    pub fn fail_all(&mut self, reason: ErrorReason) -> usize {
        let mut count = 0;
        self.streams.drain(|slot| {
            slot.link.shutdown(Some(StreamEvent::Error(reason)));
            count += 1;
        });
        self.outbound.clear();
        count
    }
}

/// Both endpoints of one stream, as handed to whoever serves it
#[derive(Debug)]
pub struct StreamHandle {
    destination: Address,
    sender: StreamSender,
    receiver: StreamReceiver,
}

impl StreamHandle {
    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.sender.id
    }

    /// Get destination address
    pub fn destination(&self) -> &Address {
        &self.destination
    }

    /// Wait for the relay to acknowledge the open (client side)
    pub async fn wait_open(&mut self) -> Result<(), TunnelError> {
        match self.receiver.events.recv().await {
            Some(StreamEvent::Opened) => Ok(()),
            Some(StreamEvent::Error(reason)) => Err(TunnelError::Rejected(reason)),
            Some(event) => {
                // First DATA also confirms the stream
                self.receiver.pending = Some(event);
                Ok(())
            }
            None => Err(TunnelError::Unavailable),
        }
    }

    /// Acknowledge the open after a successful dial (relay side)
    pub fn accept(&self) -> Result<(), TunnelError> {
        self.sender.command(StreamCommand::Accept {
            stream_id: self.id(),
        })
    }

    /// Refuse the stream with a reason
    pub fn reject(self, reason: ErrorReason) {
        self.sender.reset(reason);
    }

    /// Split into independently owned send and receive halves
    pub fn into_split(self) -> (StreamSender, StreamReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a stream
#[derive(Debug)]
pub struct StreamSender {
    id: u32,
    cmd_tx: mpsc::UnboundedSender<StreamCommand>,
    credit: Arc<Semaphore>,
    chunk: usize,
}

impl StreamSender {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Largest payload a single DATA frame carries
    pub fn chunk_size(&self) -> usize {
        self.chunk
    }

    fn command(&self, cmd: StreamCommand) -> Result<(), TunnelError> {
        self.cmd_tx.send(cmd).map_err(|_| TunnelError::Unavailable)
    }

    /// Send data on this stream, waiting for credit as needed
    pub async fn send(&self, mut data: Bytes) -> Result<(), TunnelError> {
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(self.chunk));
            let permit = self
                .credit
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| TunnelError::StreamClosed)?;
            // Credit comes back from the peer, not from dropping the permit
            permit.forget();
            self.command(StreamCommand::Data {
                stream_id: self.id,
                data: chunk,
            })?;
        }
        Ok(())
    }

    /// Half-close the local direction
    pub fn close(&self) -> Result<(), TunnelError> {
        self.command(StreamCommand::Close { stream_id: self.id })
    }

    /// Abort the stream
    pub fn reset(&self, reason: ErrorReason) {
        let _ = self.command(StreamCommand::Reset {
            stream_id: self.id,
            reason,
        });
    }
}

/// Receiving half of a stream.
///
/// Dropping it while the stream is still live resets the stream.
#[derive(Debug)]
pub struct StreamReceiver {
    id: u32,
    cmd_tx: mpsc::UnboundedSender<StreamCommand>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    pending: Option<StreamEvent>,
}

impl StreamReceiver {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Receive the next event. `None` means the stream is gone.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.pending.take() {
            return Some(event);
        }
        self.events.recv().await
    }

    /// Report bytes written to the local socket
    pub fn consumed(&self, bytes: usize) {
        let _ = self.cmd_tx.send(StreamCommand::Consumed {
            stream_id: self.id,
            bytes,
        });
    }

    /// Abort the stream
    pub fn reset(&self, reason: ErrorReason) {
        let _ = self.cmd_tx.send(StreamCommand::Reset {
            stream_id: self.id,
            reason,
        });
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(StreamCommand::Release { stream_id: self.id });
    }
}
