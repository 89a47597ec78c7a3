//! Local endpoint state, the application-facing handle, and the outbound
//! connect path.
//!
//! Lock order is remote before local: a thread holding a remote's state cell
//! may take its local endpoint's lock, never the reverse. Every loop below
//! that needs both releases the local lock before touching a remote.

use std::collections::HashMap;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::addr::EndPointAddr;
use crate::connection::Connection;
use crate::error::{ConnectError, TransportError};
use crate::event::{ConnectionId, Event, Reliability};
use crate::frame::{self, FrameError, FrameReader, encode_i32};
use crate::proto::{ConnectionRequestResponse, ControlHeader, FIRST_NON_RESERVED_CONNECTION_ID};
use crate::remote::{
    Origin, ReaderContext, RemoteEndPoint, RemoteState, ValidRemote, close_if_unused,
    run_incoming_loop, send_on,
};
use crate::transport::{TransportConfig, TransportInner};

/// Per-call overrides for [`EndPoint::connect`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectHints {
    /// Overrides the transport-wide connect timeout when set.
    pub timeout: Option<Duration>,
}

pub(crate) struct LocalEndPoint {
    pub(crate) addr: EndPointAddr,
    pub(crate) config: TransportConfig,
    state: Mutex<LocalState>,
}

enum LocalState {
    Valid(ValidLocal),
    Closed,
}

struct ValidLocal {
    events_tx: Sender<Event>,
    next_connection_id: i32,
    next_ctrl_request_id: i32,
    /// One single-shot slot per in-flight control request; the reader loop
    /// removes the slot when it delivers, keeping the table bounded.
    pending_ctrl_requests: HashMap<i32, Sender<Vec<u8>>>,
    remotes: HashMap<EndPointAddr, Arc<RemoteEndPoint>>,
    next_remote_id: u64,
}

impl LocalEndPoint {
    pub(crate) fn new(
        addr: EndPointAddr,
        config: TransportConfig,
    ) -> (Arc<Self>, Receiver<Event>) {
        let (events_tx, events_rx) = channel::unbounded();
        let local = Arc::new(Self {
            addr,
            config,
            state: Mutex::new(LocalState::Valid(ValidLocal {
                events_tx,
                next_connection_id: FIRST_NON_RESERVED_CONNECTION_ID,
                next_ctrl_request_id: 0,
                pending_ctrl_requests: HashMap::new(),
                remotes: HashMap::new(),
                next_remote_id: 0,
            })),
        });
        (local, events_rx)
    }

    fn lock_state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver an event to the mailbox. A closed endpoint drops the event:
    /// nothing is delivered after EndPointClosed.
    pub(crate) fn post_event(&self, event: Event) -> bool {
        let state = self.lock_state();
        match &*state {
            LocalState::Valid(valid) => valid.events_tx.send(event).is_ok(),
            LocalState::Closed => false,
        }
    }

    /// Next connection id; ids start above the control range and are never
    /// reused within the endpoint's lifetime.
    pub(crate) fn alloc_connection_id(&self) -> Option<ConnectionId> {
        let mut state = self.lock_state();
        match &mut *state {
            LocalState::Valid(valid) => {
                let id = ConnectionId::from_wire(valid.next_connection_id);
                valid.next_connection_id += 1;
                Some(id)
            }
            LocalState::Closed => None,
        }
    }

    /// Drop the remote from the registry, but only if the entry still is this
    /// remote: a successor under the same address must survive.
    pub(crate) fn unlink(&self, remote: &RemoteEndPoint) {
        let mut state = self.lock_state();
        if let LocalState::Valid(valid) = &mut *state
            && valid
                .remotes
                .get(&remote.addr)
                .is_some_and(|entry| entry.id == remote.id)
        {
            valid.remotes.remove(&remote.addr);
        }
    }

    pub(crate) fn take_pending_ctrl(&self, req_id: i32) -> Option<Sender<Vec<u8>>> {
        let mut state = self.lock_state();
        match &mut *state {
            LocalState::Valid(valid) => valid.pending_ctrl_requests.remove(&req_id),
            LocalState::Closed => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_remote_for_test(&self, remote: Arc<RemoteEndPoint>) {
        let mut state = self.lock_state();
        if let LocalState::Valid(valid) = &mut *state {
            valid.remotes.insert(remote.addr.clone(), remote);
        }
    }

    #[cfg(test)]
    pub(crate) fn has_remote_for_test(&self, addr: &EndPointAddr) -> bool {
        let state = self.lock_state();
        match &*state {
            LocalState::Valid(valid) => valid.remotes.contains_key(addr),
            LocalState::Closed => false,
        }
    }
}

/// Handle to a local endpoint: an addressable mailbox plus its connect
/// surface. Obtained from [`TcpTransport::new_endpoint`].
///
/// [`TcpTransport::new_endpoint`]: crate::TcpTransport::new_endpoint
pub struct EndPoint {
    transport: Arc<TransportInner>,
    local: Arc<LocalEndPoint>,
    events: Receiver<Event>,
}

impl EndPoint {
    pub(crate) fn new(
        transport: Arc<TransportInner>,
        local: Arc<LocalEndPoint>,
        events: Receiver<Event>,
    ) -> Self {
        Self {
            transport,
            local,
            events,
        }
    }

    pub fn address(&self) -> &EndPointAddr {
        &self.local.addr
    }

    /// Block until the next event. After the endpoint is closed and the
    /// mailbox has drained, every call returns [`Event::EndPointClosed`].
    pub fn receive(&self) -> Event {
        match self.events.recv() {
            Ok(event) => event,
            Err(_) => Event::EndPointClosed,
        }
    }

    /// Non-blocking receive; `None` means the mailbox is currently empty.
    pub fn try_receive(&self) -> Option<Event> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Event::EndPointClosed),
        }
    }

    /// Bounded receive; `None` means no event arrived in time.
    pub fn receive_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Event::EndPointClosed),
        }
    }

    /// Open a logical connection to `peer`, reusing the shared physical
    /// socket when one exists in either direction.
    ///
    /// Only reliable-ordered delivery is implemented; other requested modes
    /// are accepted and coerced.
    pub fn connect(
        &self,
        peer: &EndPointAddr,
        _reliability: Reliability,
        hints: ConnectHints,
    ) -> Result<Connection, ConnectError> {
        if *peer == self.local.addr {
            return connect_to_self(&self.local);
        }
        let timeout = hints.timeout.unwrap_or(self.local.config.connect_timeout);
        let deadline = Instant::now() + timeout;
        let remote = create_connection_to(&self.local, peer, deadline)?;
        match request_connection_id(&self.local, &remote, deadline) {
            Ok(id) => {
                let mut cell = remote.lock_cell();
                if let RemoteState::Valid(valid) = &mut *cell {
                    valid.outgoing_ids.insert(id);
                }
                drop(cell);
                Ok(Connection::new_remote(Arc::clone(&remote), id))
            }
            Err(err) => {
                // Release this connection's reference on the socket.
                let mut cell = remote.lock_cell();
                if let RemoteState::Valid(valid) = &mut *cell {
                    valid.outgoing = valid.outgoing.saturating_sub(1);
                }
                let _ = close_if_unused(&mut cell);
                Err(err)
            }
        }
    }

    /// Close the endpoint: unlink it from the transport, retire every remote
    /// with a best-effort CloseSocket, and deliver a final EndPointClosed.
    /// Idempotent.
    pub fn close(&self) {
        self.transport.unlink_endpoint(&self.local.addr);
        shutdown_local_endpoint(&self.local);
    }

    pub fn new_multicast_group(&self) -> Result<(), TransportError> {
        Err(TransportError::NotSupported("multicast"))
    }

    pub fn resolve_multicast_group(&self, _group: &EndPointAddr) -> Result<(), TransportError> {
        Err(TransportError::NotSupported("multicast"))
    }
}

/// Self-connects bypass the network: events are looped straight back into
/// the local mailbox.
fn connect_to_self(local: &Arc<LocalEndPoint>) -> Result<Connection, ConnectError> {
    let mut state = local.lock_state();
    let LocalState::Valid(valid) = &mut *state else {
        return Err(ConnectError::Failed {
            reason: "endpoint closed".into(),
        });
    };
    let id = ConnectionId::from_wire(valid.next_connection_id);
    valid.next_connection_id += 1;
    let _ = valid.events_tx.send(Event::ConnectionOpened {
        id,
        reliability: Reliability::ReliableOrdered,
        peer: local.addr.clone(),
    });
    drop(state);
    Ok(Connection::new_loopback(Arc::clone(local), id))
}

enum FindOutcome {
    /// Freshly inserted Init remote; the caller spawns its setup worker.
    Fresh(Arc<RemoteEndPoint>),
    /// Existing Valid remote; `outgoing` was incremented under its lock.
    Ready(Arc<RemoteEndPoint>),
}

/// Find-or-create loop behind `connect`.
///
/// The loop always re-enters after a resolved signal and performs its
/// `outgoing` increment in the Valid branch. On the crossed path the socket
/// that survives was published by the listener-side handler rather than by
/// our own setup worker, and this shape counts the reference correctly
/// either way.
fn create_connection_to(
    local: &Arc<LocalEndPoint>,
    peer: &EndPointAddr,
    deadline: Instant,
) -> Result<Arc<RemoteEndPoint>, ConnectError> {
    loop {
        match find_remote_local(local, peer, deadline)? {
            FindOutcome::Ready(remote) => return Ok(remote),
            FindOutcome::Fresh(remote) => {
                {
                    let local = Arc::clone(local);
                    let remote = Arc::clone(&remote);
                    thread::spawn(move || setup_remote(&local, &remote));
                }
                // Wait on the attempt just started; going straight back to
                // the registry could race the worker's failure cleanup and
                // redial in a tight loop.
                wait_remote_resolution(local, &remote, deadline)?;
            }
        }
    }
}

/// Block until the remote leaves Init/Closing. An Invalid resolution
/// replays the setup error.
fn wait_remote_resolution(
    local: &Arc<LocalEndPoint>,
    remote: &Arc<RemoteEndPoint>,
    deadline: Instant,
) -> Result<(), ConnectError> {
    let mut cell = remote.lock_cell();
    loop {
        match &*cell {
            RemoteState::Init { .. } | RemoteState::Closing(_) => {
                match remote.wait_step(cell, deadline) {
                    Ok(guard) => cell = guard,
                    Err(err) => {
                        invalidate_stuck_init(local, remote);
                        return Err(err);
                    }
                }
            }
            RemoteState::Invalid(err) => return Err(err.clone()),
            RemoteState::Valid(_) | RemoteState::Closed => return Ok(()),
        }
    }
}

/// Resolved-signal timeout fallback: a remote stuck in Init (a crossed
/// attempt whose inbound side never materialized) is unlinked and
/// invalidated, so neither its waiters nor later attempts wedge behind it.
fn invalidate_stuck_init(local: &Arc<LocalEndPoint>, remote: &Arc<RemoteEndPoint>) {
    let mut cell = remote.lock_cell();
    if matches!(*cell, RemoteState::Init { .. }) {
        local.unlink(remote);
        *cell = RemoteState::Invalid(ConnectError::Timeout);
        remote.notify_resolved();
    }
}

fn find_remote_local(
    local: &Arc<LocalEndPoint>,
    peer: &EndPointAddr,
    deadline: Instant,
) -> Result<FindOutcome, ConnectError> {
    loop {
        let (remote, fresh) = {
            let mut state = local.lock_state();
            let LocalState::Valid(valid) = &mut *state else {
                return Err(ConnectError::Failed {
                    reason: "endpoint closed".into(),
                });
            };
            match valid.remotes.get(peer) {
                Some(remote) => (Arc::clone(remote), false),
                None => {
                    let remote = Arc::new(RemoteEndPoint::new(
                        peer.clone(),
                        valid.next_remote_id,
                        Origin::Local,
                    ));
                    valid.next_remote_id += 1;
                    valid.remotes.insert(peer.clone(), Arc::clone(&remote));
                    (remote, true)
                }
            }
        };
        if fresh {
            return Ok(FindOutcome::Fresh(remote));
        }
        let mut cell = remote.lock_cell();
        loop {
            match &mut *cell {
                RemoteState::Valid(valid) => {
                    valid.outgoing += 1;
                    drop(cell);
                    return Ok(FindOutcome::Ready(remote));
                }
                RemoteState::Init { .. } | RemoteState::Closing(_) => {
                    match remote.wait_step(cell, deadline) {
                        Ok(guard) => cell = guard,
                        Err(err) => {
                            invalidate_stuck_init(local, &remote);
                            return Err(err);
                        }
                    }
                }
                RemoteState::Invalid(err) => return Err(err.clone()),
                RemoteState::Closed => {
                    // Already unlinked; retry the registry lookup.
                    break;
                }
            }
        }
    }
}

/// Outbound setup worker: dial, handshake, then either become the peer's
/// reader or stand down on a crossed attempt.
fn setup_remote(local: &Arc<LocalEndPoint>, remote: &Arc<RemoteEndPoint>) {
    match dial_handshake(local, remote) {
        Ok(Some((stream, mut reader))) => {
            let published = {
                let mut cell = remote.lock_cell();
                if matches!(*cell, RemoteState::Init { .. }) {
                    *cell = RemoteState::Valid(ValidRemote::new(stream));
                    remote.notify_resolved();
                    true
                } else {
                    // The endpoint shut down while we were dialing.
                    false
                }
            };
            if published {
                tracing::info!(peer = %remote.addr, "outbound connection established");
                let ctx = ReaderContext {
                    local: Arc::clone(local),
                    remote: Arc::clone(remote),
                };
                run_incoming_loop(&ctx, &mut reader);
            }
        }
        Ok(None) => {
            // Crossed: the peer reuses its own outbound socket for us. The
            // listener-side handler publishes this remote when it arrives.
        }
        Err(err) => {
            local.unlink(remote);
            let mut cell = remote.lock_cell();
            if matches!(*cell, RemoteState::Init { .. }) {
                *cell = RemoteState::Invalid(err);
                remote.notify_resolved();
            }
        }
    }
}

/// Dial the peer and run the connection-request handshake.
///
/// `Ok(Some(..))` carries the accepted socket's write half and its framed
/// read half; `Ok(None)` is a crossed attempt whose socket was discarded.
fn dial_handshake(
    local: &LocalEndPoint,
    remote: &RemoteEndPoint,
) -> Result<Option<(TcpStream, FrameReader<TcpStream>)>, ConnectError> {
    let timeout = local.config.connect_timeout;
    let stream = dial(&remote.addr, timeout)?;
    let io_err = |err: std::io::Error| ConnectError::from_io(&err);

    stream.set_nodelay(true).map_err(io_err)?;
    // The handshake itself is bounded; the reader loop later clears this.
    stream.set_read_timeout(Some(timeout)).map_err(io_err)?;

    let our_addr = local.addr.as_bytes();
    frame::send_many(
        &mut (&stream),
        &[
            &encode_i32(remote.addr.endpoint_id()),
            &encode_i32(our_addr.len() as i32),
            our_addr,
        ],
    )
    .map_err(io_err)?;

    let mut reader = FrameReader::new(
        stream.try_clone().map_err(io_err)?,
        local.config.max_frame_bytes,
    );
    let response = reader.read_i32().map_err(|err| match err {
        FrameError::Io(err) => ConnectError::from_io(&err),
        other => ConnectError::Failed {
            reason: other.to_string(),
        },
    })?;
    match ConnectionRequestResponse::from_wire(response) {
        Some(ConnectionRequestResponse::Accepted) => {
            stream.set_read_timeout(None).map_err(io_err)?;
            Ok(Some((stream, reader)))
        }
        Some(ConnectionRequestResponse::Invalid) => Err(ConnectError::NotFound),
        Some(ConnectionRequestResponse::Crossed) => {
            let _ = stream.shutdown(Shutdown::Both);
            Ok(None)
        }
        None => Err(ConnectError::Failed {
            reason: format!("unexpected connection response {response}"),
        }),
    }
}

fn dial(peer: &EndPointAddr, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let addrs = peer
        .socket_addr()
        .to_socket_addrs()
        .map_err(|_| ConnectError::NotFound)?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) => Err(ConnectError::from_io(&err)),
        None => Err(ConnectError::NotFound),
    }
}

/// RequestConnectionId exchange: register a single-shot slot, send the
/// request on the shared socket, and rendezvous with the reader loop.
fn request_connection_id(
    local: &Arc<LocalEndPoint>,
    remote: &Arc<RemoteEndPoint>,
    deadline: Instant,
) -> Result<ConnectionId, ConnectError> {
    let (slot_tx, slot_rx) = channel::bounded(1);
    let req_id = {
        let mut state = local.lock_state();
        let LocalState::Valid(valid) = &mut *state else {
            return Err(ConnectError::Failed {
                reason: "endpoint closed".into(),
            });
        };
        let req_id = valid.next_ctrl_request_id;
        valid.next_ctrl_request_id += 1;
        valid.pending_ctrl_requests.insert(req_id, slot_tx);
        req_id
    };

    let sent = {
        let mut cell = remote.lock_cell();
        match &mut *cell {
            RemoteState::Valid(valid) => send_on(
                valid,
                &[
                    &encode_i32(ControlHeader::RequestConnectionId.to_wire()),
                    &encode_i32(req_id),
                ],
            )
            .map_err(|err| ConnectError::from_io(&err)),
            _ => Err(ConnectError::Failed {
                reason: "connection to peer lost".into(),
            }),
        }
    };
    if let Err(err) = sent {
        local.take_pending_ctrl(req_id);
        return Err(err);
    }

    match slot_rx.recv_deadline(deadline) {
        Ok(blob) => decode_connection_id(&blob),
        Err(RecvTimeoutError::Disconnected) => Err(ConnectError::Failed {
            reason: "endpoint closed".into(),
        }),
        Err(RecvTimeoutError::Timeout) => {
            // If the slot is gone the reader delivered just as we timed out;
            // drain it once more before giving up.
            if local.take_pending_ctrl(req_id).is_some() {
                Err(ConnectError::Timeout)
            } else {
                match slot_rx.try_recv() {
                    Ok(blob) => decode_connection_id(&blob),
                    Err(_) => Err(ConnectError::Timeout),
                }
            }
        }
    }
}

fn decode_connection_id(blob: &[u8]) -> Result<ConnectionId, ConnectError> {
    let bytes: [u8; 4] = blob.try_into().map_err(|_| ConnectError::Failed {
        reason: "malformed connection id response".into(),
    })?;
    Ok(ConnectionId::from_wire(i32::from_be_bytes(bytes)))
}

/// Verdict on an inbound connection request for `peer`.
pub(crate) enum IncomingDecision {
    /// Build Valid around the accepted socket: a fresh remote, or a taken
    /// over outbound Init that lost the address tiebreak.
    Accept(Arc<RemoteEndPoint>),
    /// Simultaneous attempt and we hold the lower address: the peer must use
    /// our outbound socket instead.
    Crossed,
    /// Duplicate or unserviceable request; force-close without a response.
    Reject,
}

pub(crate) fn find_remote_incoming(
    local: &Arc<LocalEndPoint>,
    peer: &EndPointAddr,
    deadline: Instant,
) -> IncomingDecision {
    loop {
        let (remote, fresh) = {
            let mut state = local.lock_state();
            let LocalState::Valid(valid) = &mut *state else {
                return IncomingDecision::Reject;
            };
            match valid.remotes.get(peer) {
                Some(remote) => (Arc::clone(remote), false),
                None => {
                    let remote = Arc::new(RemoteEndPoint::new(
                        peer.clone(),
                        valid.next_remote_id,
                        Origin::Remote,
                    ));
                    valid.next_remote_id += 1;
                    valid.remotes.insert(peer.clone(), Arc::clone(&remote));
                    (remote, true)
                }
            }
        };
        if fresh {
            return IncomingDecision::Accept(remote);
        }
        let mut cell = remote.lock_cell();
        loop {
            match &*cell {
                RemoteState::Init {
                    origin: Origin::Local,
                } => {
                    // Both sides dialed at once. The lexicographically lower
                    // address keeps its outbound socket.
                    drop(cell);
                    return if local.addr < *peer {
                        IncomingDecision::Crossed
                    } else {
                        IncomingDecision::Accept(remote)
                    };
                }
                RemoteState::Init {
                    origin: Origin::Remote,
                }
                | RemoteState::Valid(_) => {
                    // A live inbound-origin remote already exists for this
                    // peer: duplicate request.
                    drop(cell);
                    return IncomingDecision::Reject;
                }
                RemoteState::Closing(_) => match remote.wait_step(cell, deadline) {
                    Ok(guard) => cell = guard,
                    Err(_) => return IncomingDecision::Reject,
                },
                RemoteState::Closed | RemoteState::Invalid(_) => break,
            }
        }
    }
}

/// Retire the endpoint's state: close remotes, deliver EndPointClosed, drop
/// the mailbox sender and pending slots. Idempotent; callers unlink from the
/// transport registry themselves when needed.
pub(crate) fn shutdown_local_endpoint(local: &Arc<LocalEndPoint>) {
    let taken = {
        let mut state = local.lock_state();
        match std::mem::replace(&mut *state, LocalState::Closed) {
            LocalState::Valid(valid) => Some(valid),
            LocalState::Closed => None,
        }
    };
    let Some(valid) = taken else {
        return;
    };
    for remote in valid.remotes.values() {
        close_remote_for_shutdown(remote);
    }
    let _ = valid.events_tx.send(Event::EndPointClosed);
    tracing::info!(addr = %local.addr, "endpoint closed");
    // Dropping the taken state drops the mailbox sender and every pending
    // control slot; blocked receivers observe the disconnect.
}

fn close_remote_for_shutdown(remote: &RemoteEndPoint) {
    let mut cell = remote.lock_cell();
    let taken = std::mem::replace(&mut *cell, RemoteState::Closed);
    match taken {
        RemoteState::Valid(valid) => {
            let _ = send_on(&valid, &[&encode_i32(ControlHeader::CloseSocket.to_wire())]);
            let _ = valid.stream.shutdown(Shutdown::Both);
            remote.notify_resolved();
        }
        RemoteState::Closing(valid) => {
            let _ = valid.stream.shutdown(Shutdown::Both);
            remote.notify_resolved();
        }
        RemoteState::Init { .. } => {
            // Setup still in flight; its worker sees the closed cell and
            // discards whatever socket it ends up with.
            remote.notify_resolved();
        }
        other => {
            *cell = other;
        }
    }
}
