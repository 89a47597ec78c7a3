//! Remote endpoint state cell, per-peer reader loop, and the CloseSocket
//! protocol.
//!
//! One `RemoteEndPoint` exists per peer address and owns the single physical
//! socket shared by every logical connection to that peer, in both
//! directions. All socket writes happen under the state cell's mutex, so
//! frames never interleave. The paired condvar is the resolved signal for
//! Init and Closing states: every transition out of those states notifies
//! all waiters together with the state publication.

use std::collections::BTreeSet;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use thiserror::Error;

use crate::addr::EndPointAddr;
use crate::endpoint::LocalEndPoint;
use crate::error::ConnectError;
use crate::event::{ConnectionId, Event, Reliability};
use crate::frame::{self, FrameError, FrameReader, encode_i32};
use crate::proto::{ControlHeader, FIRST_NON_RESERVED_CONNECTION_ID};

/// Which side initiated the remote's setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Origin {
    Local,
    Remote,
}

pub(crate) enum RemoteState {
    /// Setup in progress; no socket published yet.
    Init { origin: Origin },
    Valid(ValidRemote),
    /// CloseSocket sent, awaiting the peer's verdict. The snapshot keeps the
    /// socket readable: the peer may still refuse the close.
    Closing(ValidRemote),
    Closed,
    /// Setup failed; the error is replayed to every waiter.
    Invalid(ConnectError),
}

pub(crate) struct ValidRemote {
    pub(crate) stream: TcpStream,
    /// Live logical connections we opened to the peer.
    pub(crate) outgoing: u32,
    /// Peer-allocated ids of those connections, once known.
    pub(crate) outgoing_ids: BTreeSet<ConnectionId>,
    /// Ids we allocated for connections the peer opened to us.
    pub(crate) incoming: BTreeSet<ConnectionId>,
}

impl ValidRemote {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            outgoing: 0,
            outgoing_ids: BTreeSet::new(),
            incoming: BTreeSet::new(),
        }
    }
}

pub(crate) struct RemoteEndPoint {
    /// Peer address. Never a back-reference to the local endpoint.
    pub(crate) addr: EndPointAddr,
    /// Disambiguates this remote from an evicted predecessor under the same
    /// address: a closed remote is unlinked before it turns Closed, so a
    /// fresh lookup either misses or finds a successor with a different id.
    pub(crate) id: u64,
    cell: Mutex<RemoteState>,
    resolved: Condvar,
}

impl RemoteEndPoint {
    pub(crate) fn new(addr: EndPointAddr, id: u64, origin: Origin) -> Self {
        Self {
            addr,
            id,
            cell: Mutex::new(RemoteState::Init { origin }),
            resolved: Condvar::new(),
        }
    }

    pub(crate) fn lock_cell(&self) -> MutexGuard<'_, RemoteState> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_resolved(&self) {
        self.resolved.notify_all();
    }

    /// One bounded wait on the resolved signal. The caller re-inspects the
    /// state it gets back and decides whether to wait again.
    pub(crate) fn wait_step<'a>(
        &'a self,
        guard: MutexGuard<'a, RemoteState>,
        deadline: Instant,
    ) -> Result<MutexGuard<'a, RemoteState>, ConnectError> {
        let now = Instant::now();
        if now >= deadline {
            return Err(ConnectError::Timeout);
        }
        let (guard, _) = self
            .resolved
            .wait_timeout(guard, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        Ok(guard)
    }
}

/// Write chunks to the peer as one contiguous write. Callers hold the state
/// cell's lock.
pub(crate) fn send_on(valid: &ValidRemote, parts: &[&[u8]]) -> std::io::Result<()> {
    frame::send_many(&mut (&valid.stream), parts)
}

/// If no logical connection uses the socket anymore, offer the peer a close:
/// send CloseSocket and move to Closing. The socket stays open and readable
/// until the peer agrees or refuses.
pub(crate) fn close_if_unused(state: &mut RemoteState) -> std::io::Result<()> {
    if let RemoteState::Valid(valid) = state
        && valid.outgoing == 0
        && valid.incoming.is_empty()
    {
        send_on(valid, &[&encode_i32(ControlHeader::CloseSocket.to_wire())])?;
        let taken = std::mem::replace(state, RemoteState::Closed);
        if let RemoteState::Valid(valid) = taken {
            *state = RemoteState::Closing(valid);
        }
    }
    Ok(())
}

#[derive(Debug, Error)]
pub(crate) enum ReaderError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

pub(crate) struct ReaderContext {
    pub(crate) local: Arc<LocalEndPoint>,
    pub(crate) remote: Arc<RemoteEndPoint>,
}

/// Per-peer reader. Runs on the thread that finished the handshake and owns
/// the read half of the socket until the socket dies or the close protocol
/// retires it.
pub(crate) fn run_incoming_loop(ctx: &ReaderContext, reader: &mut FrameReader<TcpStream>) {
    if let Err(err) = read_frames(ctx, reader) {
        premature_exit(ctx, &err);
    }
}

fn read_frames(
    ctx: &ReaderContext,
    reader: &mut FrameReader<TcpStream>,
) -> Result<(), ReaderError> {
    loop {
        let word = reader.read_i32()?;
        if word >= FIRST_NON_RESERVED_CONNECTION_ID {
            // User message. Id validity is not checked: a peer inventing ids
            // corrupts only its own event stream.
            let payload = reader.read_bytes()?;
            ctx.local.post_event(Event::Received {
                id: ConnectionId::from_wire(word),
                payload,
            });
            continue;
        }
        match ControlHeader::from_wire(word) {
            Some(ControlHeader::RequestConnectionId) => {
                handle_request_connection_id(ctx, reader)?;
            }
            Some(ControlHeader::CloseConnection) => {
                let id = ConnectionId::from_wire(reader.read_i32()?);
                handle_close_connection(ctx, id)?;
            }
            Some(ControlHeader::ControlResponse) => {
                let req_id = reader.read_i32()?;
                let blob = reader.read_bytes()?;
                handle_control_response(ctx, req_id, blob);
            }
            Some(ControlHeader::CloseSocket) => {
                if handle_close_socket(ctx)? {
                    return Ok(());
                }
            }
            None => {
                tracing::warn!(peer = %ctx.remote.addr, value = word, "unknown control header");
                return Err(ReaderError::Protocol("unknown control header"));
            }
        }
    }
}

/// Allocate a connection id for the peer and answer with a ControlResponse.
///
/// A request arriving while we are Closing means the peer refused our
/// CloseSocket by racing a new connection onto the socket; the remote is
/// promoted back to Valid and the resolved signal fires.
fn handle_request_connection_id(
    ctx: &ReaderContext,
    reader: &mut FrameReader<TcpStream>,
) -> Result<(), ReaderError> {
    let req_id = reader.read_i32()?;

    let mut cell = ctx.remote.lock_cell();
    let taken = std::mem::replace(&mut *cell, RemoteState::Closed);
    let (mut valid, was_closing) = match taken {
        RemoteState::Valid(valid) => (valid, false),
        RemoteState::Closing(valid) => (valid, true),
        other => {
            *cell = other;
            drop(cell);
            tracing::warn!(peer = %ctx.remote.addr, "connection id requested in unexpected state");
            return Err(ReaderError::Protocol(
                "connection id request in unexpected state",
            ));
        }
    };
    let Some(id) = ctx.local.alloc_connection_id() else {
        *cell = RemoteState::Valid(valid);
        return Err(ReaderError::Protocol(
            "endpoint closed during connection id request",
        ));
    };
    let sent = send_on(
        &valid,
        &[
            &encode_i32(ControlHeader::ControlResponse.to_wire()),
            &encode_i32(req_id),
            &encode_i32(4),
            &encode_i32(id.to_wire()),
        ],
    );
    match sent {
        Ok(()) => {
            valid.incoming.insert(id);
            *cell = RemoteState::Valid(valid);
            if was_closing {
                ctx.remote.notify_resolved();
            }
            drop(cell);
            ctx.local.post_event(Event::ConnectionOpened {
                id,
                reliability: Reliability::ReliableOrdered,
                peer: ctx.remote.addr.clone(),
            });
            Ok(())
        }
        Err(err) => {
            *cell = RemoteState::Valid(valid);
            drop(cell);
            Err(ReaderError::Io(err))
        }
    }
}

fn handle_close_connection(ctx: &ReaderContext, id: ConnectionId) -> Result<(), ReaderError> {
    let mut cell = ctx.remote.lock_cell();
    match &mut *cell {
        RemoteState::Valid(valid) => {
            if !valid.incoming.remove(&id) {
                drop(cell);
                tracing::warn!(peer = %ctx.remote.addr, %id, "close of unknown incoming connection");
                return Err(ReaderError::Protocol("close of unknown incoming connection"));
            }
        }
        _ => {
            drop(cell);
            tracing::warn!(peer = %ctx.remote.addr, "connection close in unexpected state");
            return Err(ReaderError::Protocol("connection close in unexpected state"));
        }
    }
    ctx.local.post_event(Event::ConnectionClosed { id });
    close_if_unused(&mut cell).map_err(ReaderError::Io)
}

fn handle_control_response(ctx: &ReaderContext, req_id: i32, blob: Vec<u8>) {
    match ctx.local.take_pending_ctrl(req_id) {
        Some(slot) => {
            // The requester may have timed out between our lookup and this
            // send; it drains the slot once more before giving up.
            let _ = slot.send(blob);
        }
        None => {
            // Late response; the requester already gave up.
        }
    }
}

/// Returns `Ok(true)` when the socket is retired and the reader must exit.
fn handle_close_socket(ctx: &ReaderContext) -> Result<bool, ReaderError> {
    let mut cell = ctx.remote.lock_cell();
    let taken = std::mem::replace(&mut *cell, RemoteState::Closed);
    match taken {
        RemoteState::Valid(mut valid) => {
            let orphaned = std::mem::take(&mut valid.incoming);
            for id in orphaned {
                ctx.local.post_event(Event::ConnectionClosed { id });
            }
            if valid.outgoing == 0 {
                // Agreement: unlink first, then retire the socket.
                ctx.local.unlink(&ctx.remote);
                let _ = send_on(&valid, &[&encode_i32(ControlHeader::CloseSocket.to_wire())]);
                let _ = valid.stream.shutdown(Shutdown::Both);
                ctx.remote.notify_resolved();
                Ok(true)
            } else {
                // Our own connections still use the socket; the peer will see
                // them and cancel its close.
                *cell = RemoteState::Valid(valid);
                Ok(false)
            }
        }
        RemoteState::Closing(valid) => {
            // The peer acknowledged our close.
            ctx.local.unlink(&ctx.remote);
            let _ = valid.stream.shutdown(Shutdown::Both);
            ctx.remote.notify_resolved();
            Ok(true)
        }
        other => {
            *cell = other;
            drop(cell);
            tracing::warn!(peer = %ctx.remote.addr, "close-socket in unexpected state");
            Err(ReaderError::Protocol("close-socket in unexpected state"))
        }
    }
}

/// The reader died outside the close protocol: io failure, framing garbage,
/// or a protocol violation.
///
/// A Valid remote turns into exactly one ConnectionLost event naming every
/// logical connection that was multiplexed over the socket. A Closing remote
/// was already being torn down, so the failure only completes that teardown.
fn premature_exit(ctx: &ReaderContext, err: &ReaderError) {
    let mut cell = ctx.remote.lock_cell();
    let taken = std::mem::replace(&mut *cell, RemoteState::Closed);
    match taken {
        RemoteState::Valid(valid) => {
            ctx.local.unlink(&ctx.remote);
            let _ = valid.stream.shutdown(Shutdown::Both);
            let mut ids: BTreeSet<ConnectionId> = valid.incoming;
            ids.extend(valid.outgoing_ids);
            ctx.remote.notify_resolved();
            drop(cell);
            tracing::warn!(peer = %ctx.remote.addr, "connection to peer lost: {err}");
            ctx.local.post_event(Event::ConnectionLost {
                peer: ctx.remote.addr.clone(),
                ids: ids.into_iter().collect(),
            });
        }
        RemoteState::Closing(valid) => {
            ctx.local.unlink(&ctx.remote);
            let _ = valid.stream.shutdown(Shutdown::Both);
            ctx.remote.notify_resolved();
        }
        other => {
            // Closed or Invalid already published by another path; keep it.
            *cell = other;
        }
    }
}
