//! Ordered inbound message processing.
//!
//! One pump task per replica drains the channel's event stream. Each
//! message's decode and apply completes (or fails) before the next message
//! is taken, so updates apply in arrival order no matter how long a decode
//! suspends on reference resolution. A failure is confined to its message;
//! the chain continues.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use commsync_proto::WireMessage;

use crate::channel::ChannelEvent;
use crate::replica::Replica;

pub(crate) fn spawn_pump(
    replica: Arc<Replica>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Message { data, buffers } => {
                    let message = match WireMessage::from_json(data) {
                        Ok(message) => message,
                        Err(e) => {
                            error!(replica = %replica.id(), error = %e, "rejecting message");
                            continue;
                        }
                    };
                    match message {
                        WireMessage::Update {
                            state,
                            buffer_paths,
                        } => {
                            if let Err(e) =
                                replica.apply_update(state, &buffer_paths, buffers).await
                            {
                                error!(
                                    replica = %replica.id(),
                                    error = %e,
                                    "dropping update message"
                                );
                            }
                        }
                        WireMessage::Custom { content } => {
                            replica.handle_custom(content, buffers);
                        }
                    }
                }
                ChannelEvent::Status(status) => replica.handle_status(status).await,
                ChannelEvent::Closed => {
                    debug!(replica = %replica.id(), "channel closed, stopping pump");
                    replica.close_from_channel().await;
                    break;
                }
            }
        }
    })
}
