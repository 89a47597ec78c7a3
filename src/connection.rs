//! Logical connection handle.

use std::sync::{Arc, Mutex, PoisonError};

use crate::endpoint::LocalEndPoint;
use crate::error::SendError;
use crate::event::{ConnectionId, Event};
use crate::frame::encode_i32;
use crate::proto::ControlHeader;
use crate::remote::{RemoteEndPoint, RemoteState, close_if_unused, send_on};

/// A lightweight, ordered, reliable message channel multiplexed over the
/// shared physical socket to one peer.
///
/// `close` is idempotent; after a close, or after the underlying socket is
/// lost, `send` fails and nothing else happens.
pub struct Connection {
    inner: ConnInner,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id = match &self.inner {
            ConnInner::Remote { id, .. } => id,
            ConnInner::Loopback { id, .. } => id,
        };
        f.debug_struct("Connection").field("id", id).finish()
    }
}

enum ConnInner {
    Remote {
        remote: Arc<RemoteEndPoint>,
        id: ConnectionId,
        alive: Mutex<bool>,
    },
    /// Self-connect: messages loop straight back into the local mailbox.
    Loopback {
        local: Arc<LocalEndPoint>,
        id: ConnectionId,
        alive: Mutex<bool>,
    },
}

impl Connection {
    pub(crate) fn new_remote(remote: Arc<RemoteEndPoint>, id: ConnectionId) -> Self {
        Self {
            inner: ConnInner::Remote {
                remote,
                id,
                alive: Mutex::new(true),
            },
        }
    }

    pub(crate) fn new_loopback(local: Arc<LocalEndPoint>, id: ConnectionId) -> Self {
        Self {
            inner: ConnInner::Loopback {
                local,
                id,
                alive: Mutex::new(true),
            },
        }
    }

    /// The id the receiving endpoint assigned to this connection.
    pub fn id(&self) -> ConnectionId {
        match &self.inner {
            ConnInner::Remote { id, .. } | ConnInner::Loopback { id, .. } => *id,
        }
    }

    /// Send chunks as one message; the receiver observes a single
    /// `Received` payload holding their concatenation, in send order.
    pub fn send(&self, chunks: &[&[u8]]) -> Result<(), SendError> {
        match &self.inner {
            ConnInner::Remote { remote, id, alive } => {
                let alive = lock_flag(alive);
                if !*alive {
                    return Err(SendError::Closed);
                }
                let mut cell = remote.lock_cell();
                let RemoteState::Valid(valid) = &mut *cell else {
                    return Err(SendError::Failed {
                        reason: "connection to peer lost".into(),
                    });
                };
                let total: usize = chunks.iter().map(|chunk| chunk.len()).sum();
                let id_bytes = encode_i32(id.to_wire());
                let len_bytes = encode_i32(total as i32);
                let mut parts: Vec<&[u8]> = Vec::with_capacity(chunks.len() + 2);
                parts.push(&id_bytes);
                parts.push(&len_bytes);
                parts.extend_from_slice(chunks);
                send_on(valid, &parts).map_err(|err| SendError::Failed {
                    reason: err.to_string(),
                })
            }
            ConnInner::Loopback { local, id, alive } => {
                let alive = lock_flag(alive);
                if !*alive {
                    return Err(SendError::Closed);
                }
                let mut payload = Vec::with_capacity(chunks.iter().map(|c| c.len()).sum());
                for chunk in chunks {
                    payload.extend_from_slice(chunk);
                }
                if local.post_event(Event::Received { id: *id, payload }) {
                    Ok(())
                } else {
                    Err(SendError::Closed)
                }
            }
        }
    }

    /// Close the logical connection and release its reference on the shared
    /// socket; the last user triggers the CloseSocket offer. Idempotent, and
    /// a no-op after the peer is lost.
    pub fn close(&self) {
        match &self.inner {
            ConnInner::Remote { remote, id, alive } => {
                let mut alive = lock_flag(alive);
                if !*alive {
                    return;
                }
                *alive = false;
                let mut cell = remote.lock_cell();
                {
                    let RemoteState::Valid(valid) = &mut *cell else {
                        return;
                    };
                    let _ = send_on(
                        valid,
                        &[
                            &encode_i32(ControlHeader::CloseConnection.to_wire()),
                            &encode_i32(id.to_wire()),
                        ],
                    );
                    valid.outgoing = valid.outgoing.saturating_sub(1);
                    valid.outgoing_ids.remove(id);
                }
                let _ = close_if_unused(&mut cell);
            }
            ConnInner::Loopback { local, id, alive } => {
                let mut alive = lock_flag(alive);
                if !*alive {
                    return;
                }
                *alive = false;
                local.post_event(Event::ConnectionClosed { id: *id });
            }
        }
    }
}

fn lock_flag(alive: &Mutex<bool>) -> std::sync::MutexGuard<'_, bool> {
    alive.lock().unwrap_or_else(PoisonError::into_inner)
}
