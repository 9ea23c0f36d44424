//! Per-stream state and the stream table

use super::TunnelError;
use crate::proxy::Address;
use std::collections::HashMap;
use std::time::Instant;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// OPEN sent or received, destination not yet confirmed
    Opening,
    /// Stream is open and active
    Open,
    /// Local side has closed
    HalfClosedLocal,
    /// Remote side has closed
    HalfClosedRemote,
    /// Stream is fully closed
    Closed,
}

/// Bookkeeping for one multiplexed stream
#[derive(Debug)]
pub struct TunnelStream {
    /// Stream ID
    id: u32,
    /// Current state
    state: StreamState,
    /// Destination requested by the OPEN frame
    destination: Address,
    /// Receive window left before the peer must wait for credit
    recv_window: u32,
    /// Full receive window size
    window_size: u32,
    /// Bytes delivered to the local endpoint but not yet written out
    inbound_buffered: usize,
    /// Bytes written out since the last credit returned to the peer
    consumed_since_update: u32,
    /// Send credit exhausted at the last send attempt
    backpressured: bool,
    created_at: Instant,
    last_activity: Instant,
}

impl TunnelStream {
    /// Create a new stream in `Opening` state
    pub fn new(id: u32, destination: Address, window_size: u32) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: StreamState::Opening,
            destination,
            recv_window: window_size,
            window_size,
            inbound_buffered: 0,
            consumed_since_update: 0,
            backpressured: false,
            created_at: now,
            last_activity: now,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get current state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Get destination address
    pub fn destination(&self) -> &Address {
        &self.destination
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Bytes queued towards the local endpoint
    pub fn inbound_buffered(&self) -> usize {
        self.inbound_buffered
    }

    pub fn is_backpressured(&self) -> bool {
        self.backpressured
    }

    pub fn set_backpressured(&mut self, value: bool) {
        self.backpressured = value;
    }

    /// Record activity on the stream
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Transition `Opening -> Open`; other states are left alone
    pub fn mark_open(&mut self) {
        if self.state == StreamState::Opening {
            self.state = StreamState::Open;
        }
    }

    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_recv(&self) -> bool {
        matches!(
            self.state,
            StreamState::Opening | StreamState::Open | StreamState::HalfClosedLocal
        )
    }

    /// Account for an inbound DATA payload against the receive window
    pub fn on_data(&mut self, len: usize) -> Result<(), TunnelError> {
        if !self.can_recv() {
            return Err(TunnelError::StreamClosed);
        }
        let len = u32::try_from(len).map_err(|_| TunnelError::FlowControlViolation)?;
        if len > self.recv_window {
            return Err(TunnelError::FlowControlViolation);
        }
        self.recv_window -= len;
        self.inbound_buffered += len as usize;
        self.touch();
        Ok(())
    }

    /// Account for bytes written to the local endpoint.
    ///
    /// Returns the credit to hand back to the peer once half the window has
    /// drained.
    pub fn on_consumed(&mut self, len: usize) -> Option<u32> {
        let len = len.min(self.inbound_buffered);
        self.inbound_buffered -= len;
        self.consumed_since_update = self.consumed_since_update.saturating_add(len as u32);

        if self.consumed_since_update >= self.window_size / 2 {
            let increment = self.consumed_since_update;
            self.consumed_since_update = 0;
            self.recv_window = self.recv_window.saturating_add(increment).min(self.window_size);
            Some(increment)
        } else {
            None
        }
    }

    /// Close local side. Returns true if the state changed.
    pub fn close_local(&mut self) -> bool {
        let next = match self.state {
            StreamState::Opening | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
        let changed = next != self.state;
        self.state = next;
        changed
    }

    /// Close remote side. Returns true if the state changed.
    pub fn close_remote(&mut self) -> bool {
        let next = match self.state {
            StreamState::Opening | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
        let changed = next != self.state;
        self.state = next;
        changed
    }

    /// Force the stream to `Closed`
    pub fn terminate(&mut self) {
        self.state = StreamState::Closed;
    }

    /// Check if stream is fully closed
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }
}

/// A table entry: the stream bookkeeping plus whatever the owner attaches to it
#[derive(Debug)]
pub struct Slot<L> {
    pub stream: TunnelStream,
    pub link: L,
}

/// Registry of the live streams of one transport session.
///
/// Owned by the task driving the session, so it is never shared or locked.
#[derive(Debug)]
pub struct StreamTable<L> {
    streams: HashMap<u32, Slot<L>>,
    /// Next locally allocated ID
    next_id: u32,
    /// Set once `u32::MAX` has been handed out
    exhausted: bool,
    /// Highest ID accepted from the peer
    highest_remote: u32,
}

impl<L> Default for StreamTable<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> StreamTable<L> {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            next_id: 1,
            exhausted: false,
            highest_remote: 0,
        }
    }

    /// Allocate a fresh stream ID. IDs increase monotonically and are never
    /// reused within the session.
    pub fn allocate(&mut self) -> Result<u32, TunnelError> {
        if self.exhausted {
            return Err(TunnelError::StreamIdsExhausted);
        }
        let id = self.next_id;
        match self.next_id.checked_add(1) {
            Some(next) => self.next_id = next,
            None => self.exhausted = true,
        }
        Ok(id)
    }

    /// Register a locally allocated stream
    pub fn insert(&mut self, stream: TunnelStream, link: L) {
        self.streams.insert(stream.id(), Slot { stream, link });
    }

    /// Register a stream opened by the peer. The ID must be new and larger
    /// than any ID the peer used before.
    pub fn insert_remote(&mut self, stream: TunnelStream, link: L) -> Result<(), TunnelError> {
        let id = stream.id();
        if id <= self.highest_remote || self.streams.contains_key(&id) {
            return Err(TunnelError::InvalidFrame(format!("Stream ID {} reused", id)));
        }
        self.highest_remote = id;
        self.insert(stream, link);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&Slot<L>> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Slot<L>> {
        self.streams.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Slot<L>> {
        self.streams.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.streams.contains_key(&id)
    }

    /// Visit every stream that is not fully closed
    pub fn for_each_open<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Slot<L>),
    {
        for slot in self.streams.values_mut() {
            if !slot.stream.is_closed() {
                f(slot);
            }
        }
    }

    /// Remove every stream, handing each to `f`
    pub fn drain<F>(&mut self, mut f: F)
    where
        F: FnMut(Slot<L>),
    {
        for (_, slot) in self.streams.drain() {
            f(slot);
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest() -> Address {
        Address::Domain("example.com".to_string(), 443)
    }

    #[test]
    fn test_stream_states() {
        let mut stream = TunnelStream::new(1, dest(), 1024);
        assert_eq!(stream.state(), StreamState::Opening);
        assert!(!stream.can_send());
        assert!(stream.can_recv());

        stream.mark_open();
        assert_eq!(stream.state(), StreamState::Open);

        assert!(stream.close_local());
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        assert!(!stream.can_send());
        assert!(stream.can_recv());
        assert!(!stream.close_local());

        assert!(stream.close_remote());
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.is_closed());
    }

    #[test]
    fn test_remote_close_keeps_send_side() {
        let mut stream = TunnelStream::new(1, dest(), 1024);
        stream.mark_open();
        stream.close_remote();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        assert!(stream.can_send());
        assert!(!stream.can_recv());
        assert!(stream.on_data(1).is_err());
    }

    #[test]
    fn test_stream_flow_control() {
        let mut stream = TunnelStream::new(1, dest(), 1000);
        stream.mark_open();

        stream.on_data(600).unwrap();
        assert_eq!(stream.inbound_buffered(), 600);
        assert!(matches!(
            stream.on_data(401),
            Err(TunnelError::FlowControlViolation)
        ));

        assert_eq!(stream.on_consumed(300), None);
        assert_eq!(stream.on_consumed(200), Some(500));
        assert_eq!(stream.inbound_buffered(), 100);

        // 100 still buffered out of a 1000 window
        stream.on_data(900).unwrap();
        assert!(stream.on_data(1).is_err());
    }

    #[test]
    fn test_allocate_is_monotonic() {
        let mut table: StreamTable<()> = StreamTable::new();
        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();
        table.insert(TunnelStream::new(a, dest(), 1024), ());
        table.remove(a);
        let c = table.allocate().unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn test_allocate_exhaustion() {
        let mut table: StreamTable<()> = StreamTable::new();
        table.next_id = u32::MAX;
        assert_eq!(table.allocate().unwrap(), u32::MAX);
        assert!(matches!(
            table.allocate(),
            Err(TunnelError::StreamIdsExhausted)
        ));
    }

    #[test]
    fn test_insert_remote_rejects_reuse() {
        let mut table: StreamTable<()> = StreamTable::new();
        table
            .insert_remote(TunnelStream::new(5, dest(), 1024), ())
            .unwrap();
        assert!(table
            .insert_remote(TunnelStream::new(5, dest(), 1024), ())
            .is_err());
        assert!(table
            .insert_remote(TunnelStream::new(3, dest(), 1024), ())
            .is_err());
        table
            .insert_remote(TunnelStream::new(6, dest(), 1024), ())
            .unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_for_each_open_skips_closed() {
        let mut table: StreamTable<u32> = StreamTable::new();
        for id in 1..=3 {
            table.insert(TunnelStream::new(id, dest(), 1024), 0);
        }
        if let Some(slot) = table.get_mut(2) {
            slot.stream.terminate();
        }

        let mut seen = Vec::new();
        table.for_each_open(|slot| {
            slot.link += 1;
            seen.push(slot.stream.id());
        });
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 3]);
        assert_eq!(table.get(2).map(|s| s.link), Some(0));
    }
}
