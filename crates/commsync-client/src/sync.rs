//! The outbound throttle/coalesce state machine.
//!
//! Each replica owns one [`SyncEngine`]. At most one state send is in
//! flight; while credit is exhausted, further flushes merge into a single
//! coalesced payload that is drained as soon as the kernel acknowledges the
//! in-flight send with an `idle` status. The engine itself never touches a
//! channel: [`SyncEngine::offer`] and [`SyncEngine::acknowledge`] hand
//! ready-to-send frames back to the caller, which keeps the credit logic
//! auditable and testable in isolation.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use commsync_proto::{ExecutionStatus, SendId, StatusEvent, WireMessage};

use crate::buffers::remove_buffers;
use crate::error::SyncError;
use crate::value::Value;

/// The method tag of a flush request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushKind {
    /// Whole-state announcement of a newly created replica.
    Create,
    /// Whole-state send; replaces any buffered payload wholesale.
    Update,
    /// Partial send; merges key-wise into any buffered payload.
    Patch,
}

impl FlushKind {
    /// Whether this kind carries the whole attribute map.
    pub fn is_whole_state(&self) -> bool {
        matches!(self, FlushKind::Create | FlushKind::Update)
    }
}

/// Immutable context recorded for every transmitted frame, keyed by send id
/// in the acknowledgment table.
#[derive(Debug, Clone, Copy)]
pub struct AckContext {
    /// The send this context belongs to.
    pub send_id: SendId,
    /// The flush kind that produced the frame.
    pub kind: FlushKind,
}

/// Completion handle returned by a flush.
///
/// Resolves with the send id once the payload is actually transmitted —
/// immediately for a credit-available flush, after the next acknowledgment
/// for a buffered one. Fails if the payload is dropped before transmission.
#[derive(Debug)]
pub struct SyncTicket {
    rx: oneshot::Receiver<SendId>,
}

impl SyncTicket {
    /// Wait for the payload to be transmitted.
    pub async fn transmitted(self) -> Result<SendId, SyncError> {
        self.rx.await.map_err(|_| SyncError::Transmit {
            msg: "payload dropped before transmission".to_string(),
        })
    }
}

/// A frame ready for transmission over the channel.
pub struct OutboundFrame {
    /// Send identifier used for status correlation.
    pub send_id: SendId,
    /// The structured message.
    pub message: WireMessage,
    /// Binary payloads extracted from the state.
    pub buffers: Vec<Bytes>,
    waiters: Vec<oneshot::Sender<SendId>>,
}

impl OutboundFrame {
    /// Resolve every flush ticket coalesced into this frame.
    ///
    /// Call after the channel accepted the frame; dropping the frame instead
    /// fails the tickets.
    pub fn complete(self) {
        for waiter in self.waiters {
            let _ = waiter.send(self.send_id);
        }
    }
}

struct BufferedPayload {
    kind: FlushKind,
    state: BTreeMap<String, Value>,
    waiters: Vec<oneshot::Sender<SendId>>,
}

/// Per-replica outbound state machine: send credit, coalesced buffer, and
/// the acknowledgment table.
pub struct SyncEngine {
    next_send: u64,
    in_flight: Option<SendId>,
    buffer: Option<BufferedPayload>,
    acks: HashMap<SendId, AckContext>,
}

impl SyncEngine {
    /// A fresh engine with full credit and an empty buffer.
    pub fn new() -> Self {
        Self {
            next_send: 0,
            in_flight: None,
            buffer: None,
            acks: HashMap::new(),
        }
    }

    /// Allocate a send id outside the credit system (custom messages).
    pub fn allocate_send_id(&mut self) -> SendId {
        let id = SendId(self.next_send);
        self.next_send += 1;
        id
    }

    /// Whether a state send can go out immediately.
    pub fn credit_available(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Whether a coalesced payload is waiting for credit.
    pub fn has_buffered(&self) -> bool {
        self.buffer.is_some()
    }

    /// The coalesced payload, if any.
    pub fn buffered_state(&self) -> Option<&BTreeMap<String, Value>> {
        self.buffer.as_ref().map(|b| &b.state)
    }

    /// Offer an encoded payload for transmission.
    ///
    /// With credit available the frame is returned for immediate sending and
    /// credit is consumed; otherwise the payload merges into the coalesced
    /// buffer and `None` is returned. The ticket resolves either way once the
    /// payload is actually transmitted.
    pub fn offer(
        &mut self,
        kind: FlushKind,
        state: BTreeMap<String, Value>,
    ) -> Result<(Option<OutboundFrame>, SyncTicket), SyncError> {
        let (tx, rx) = oneshot::channel();
        let ticket = SyncTicket { rx };
        if self.in_flight.is_none() {
            let frame = self.build_frame(kind, state, vec![tx])?;
            Ok((Some(frame), ticket))
        } else {
            self.merge_into_buffer(kind, state, tx);
            Ok((None, ticket))
        }
    }

    /// Process a status event.
    ///
    /// Only an `idle` status whose parent matches the acknowledgment table
    /// releases credit. If a coalesced payload is waiting it is drained into
    /// a new frame, consuming credit again.
    pub fn acknowledge(&mut self, event: &StatusEvent) -> Option<OutboundFrame> {
        if event.status != ExecutionStatus::Idle {
            return None;
        }
        match self.acks.remove(&event.parent) {
            Some(ctx) => {
                debug!(send_id = ctx.send_id.0, kind = ?ctx.kind, "send acknowledged");
            }
            None => {
                debug!(parent = event.parent.0, "ignoring idle status for unknown send");
                return None;
            }
        }
        if self.in_flight == Some(event.parent) {
            self.in_flight = None;
        }
        let buffered = self.buffer.take()?;
        match self.build_frame(buffered.kind, buffered.state, buffered.waiters) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, "dropping coalesced payload: frame build failed");
                None
            }
        }
    }

    /// Record that a frame was rejected by the channel, returning its credit.
    pub fn transmit_failed(&mut self, send_id: SendId) {
        self.acks.remove(&send_id);
        if self.in_flight == Some(send_id) {
            self.in_flight = None;
        }
    }

    fn merge_into_buffer(
        &mut self,
        kind: FlushKind,
        state: BTreeMap<String, Value>,
        waiter: oneshot::Sender<SendId>,
    ) {
        match &mut self.buffer {
            Some(buffered) => {
                if kind.is_whole_state() {
                    buffered.kind = kind;
                    buffered.state = state;
                } else {
                    for (key, value) in state {
                        buffered.state.insert(key, value);
                    }
                }
                buffered.waiters.push(waiter);
            }
            None => {
                self.buffer = Some(BufferedPayload {
                    kind,
                    state,
                    waiters: vec![waiter],
                });
            }
        }
    }

    fn build_frame(
        &mut self,
        kind: FlushKind,
        state: BTreeMap<String, Value>,
        waiters: Vec<oneshot::Sender<SendId>>,
    ) -> Result<OutboundFrame, SyncError> {
        let (tree, buffer_paths, buffers) = remove_buffers(&state)?;
        let send_id = self.allocate_send_id();
        self.acks.insert(send_id, AckContext { send_id, kind });
        self.in_flight = Some(send_id);
        Ok(OutboundFrame {
            send_id,
            message: WireMessage::Update {
                state: tree,
                buffer_paths,
            },
            buffers,
            waiters,
        })
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}
