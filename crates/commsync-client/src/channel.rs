//! The duplex channel seam and an in-process implementation.
//!
//! A channel is exclusively owned by its replica. The outbound direction is
//! the [`Channel`] trait; the inbound direction is an ordered stream of
//! [`ChannelEvent`]s handed to the replica when it attaches.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use commsync_proto::{BufferPath, ExecutionStatus, SendId, StatusEvent, WireMessage};

use crate::error::SyncError;

/// An inbound event on a replica's channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A structured message with its out-of-band binary payloads.
    Message {
        /// The raw JSON tree of the message.
        data: serde_json::Value,
        /// Binary payloads carried alongside, in declared order.
        buffers: Vec<Bytes>,
    },
    /// An execution-status report correlated with an outbound send.
    Status(StatusEvent),
    /// The remote side closed the channel; no further events follow.
    Closed,
}

/// Outbound half of a replica's communication channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Identifier of this channel, for logging.
    fn channel_id(&self) -> &str;

    /// Send a message and its binary payloads.
    ///
    /// The transport is assumed ordered and reliable once it accepts a
    /// frame; an error here means the channel itself is unusable.
    async fn send(
        &self,
        message: &WireMessage,
        buffers: &[Bytes],
        send_id: SendId,
    ) -> Result<(), SyncError>;

    /// Close the channel. Idempotent.
    async fn close(&self) -> Result<(), SyncError>;
}

/// A frame recorded by the kernel side of a [`MemoryChannel`].
#[derive(Debug, Clone)]
pub struct SentFrame {
    /// The send identifier the replica used for this frame.
    pub send_id: SendId,
    /// The structured message.
    pub message: WireMessage,
    /// Binary payloads carried alongside.
    pub buffers: Vec<Bytes>,
}

struct Shared {
    sent: Mutex<Vec<SentFrame>>,
    fail_sends: AtomicBool,
    closed: AtomicBool,
}

/// In-process channel: the replica-facing half of a loopback pair.
///
/// The paired [`MemoryKernel`] plays the kernel: it records every sent
/// frame and injects inbound events. Used by tests and by embedders that
/// simulate a kernel locally.
pub struct MemoryChannel {
    id: String,
    to_replica: mpsc::UnboundedSender<ChannelEvent>,
    shared: Arc<Shared>,
}

/// Kernel-side handle of a [`MemoryChannel`] pair.
pub struct MemoryKernel {
    to_replica: mpsc::UnboundedSender<ChannelEvent>,
    shared: Arc<Shared>,
}

/// Create a loopback channel pair.
///
/// Returns the replica-facing channel, the event stream to hand to
/// [`Replica::attach`](crate::replica::Replica::attach), and the kernel
/// handle.
pub fn memory_channel(
    id: &str,
) -> (
    Arc<MemoryChannel>,
    mpsc::UnboundedReceiver<ChannelEvent>,
    MemoryKernel,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        sent: Mutex::new(Vec::new()),
        fail_sends: AtomicBool::new(false),
        closed: AtomicBool::new(false),
    });
    let channel = Arc::new(MemoryChannel {
        id: id.to_string(),
        to_replica: tx.clone(),
        shared: shared.clone(),
    });
    let kernel = MemoryKernel {
        to_replica: tx,
        shared,
    };
    (channel, rx, kernel)
}

#[async_trait]
impl Channel for MemoryChannel {
    fn channel_id(&self) -> &str {
        &self.id
    }

    async fn send(
        &self,
        message: &WireMessage,
        buffers: &[Bytes],
        send_id: SendId,
    ) -> Result<(), SyncError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Transmit {
                msg: format!("channel `{}` is closed", self.id),
            });
        }
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(SyncError::Transmit {
                msg: format!("channel `{}` rejected the frame", self.id),
            });
        }
        let frame = SentFrame {
            send_id,
            message: message.clone(),
            buffers: buffers.to_vec(),
        };
        self.shared
            .sent
            .lock()
            .expect("sent-frame lock poisoned")
            .push(frame);
        Ok(())
    }

    async fn close(&self) -> Result<(), SyncError> {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            let _ = self.to_replica.send(ChannelEvent::Closed);
        }
        Ok(())
    }
}

impl MemoryKernel {
    /// All frames sent so far, oldest first.
    pub fn sent(&self) -> Vec<SentFrame> {
        self.shared
            .sent
            .lock()
            .expect("sent-frame lock poisoned")
            .clone()
    }

    /// Drain and return all recorded frames.
    pub fn take_sent(&self) -> Vec<SentFrame> {
        std::mem::take(
            &mut *self
                .shared
                .sent
                .lock()
                .expect("sent-frame lock poisoned"),
        )
    }

    /// Whether either side has closed the channel.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Make subsequent sends fail, simulating an unusable transport.
    pub fn fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Inject an `update` message.
    pub fn push_update(
        &self,
        state: serde_json::Value,
        buffer_paths: Vec<BufferPath>,
        buffers: Vec<Bytes>,
    ) -> Result<(), SyncError> {
        let data = WireMessage::Update {
            state,
            buffer_paths,
        }
        .to_json()?;
        self.push_raw(data, buffers);
        Ok(())
    }

    /// Inject a `custom` message.
    pub fn push_custom(
        &self,
        content: serde_json::Value,
        buffers: Vec<Bytes>,
    ) -> Result<(), SyncError> {
        let data = WireMessage::Custom { content }.to_json()?;
        self.push_raw(data, buffers);
        Ok(())
    }

    /// Inject a raw message tree, bypassing message validation.
    pub fn push_raw(&self, data: serde_json::Value, buffers: Vec<Bytes>) {
        let _ = self
            .to_replica
            .send(ChannelEvent::Message { data, buffers });
    }

    /// Report an execution status correlated with `parent`.
    pub fn report_status(&self, status: ExecutionStatus, parent: SendId) {
        let _ = self
            .to_replica
            .send(ChannelEvent::Status(StatusEvent { status, parent }));
    }

    /// Report the `idle` status that acknowledges `parent`.
    pub fn report_idle(&self, parent: SendId) {
        self.report_status(ExecutionStatus::Idle, parent);
    }

    /// Close the channel from the kernel side.
    pub fn close_from_kernel(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            let _ = self.to_replica.send(ChannelEvent::Closed);
        }
    }
}
