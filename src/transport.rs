//! Transport registry, accept loop, and inbound connection dispatch.

use std::collections::HashMap;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::addr::{AddrError, EndPointAddr};
use crate::endpoint::{
    EndPoint, IncomingDecision, LocalEndPoint, find_remote_incoming, shutdown_local_endpoint,
};
use crate::error::{ConnectError, NewEndPointError, TransportError};
use crate::event::Event;
use crate::frame::{self, FrameError, FrameReader, encode_i32};
use crate::proto::ConnectionRequestResponse;
use crate::remote::{ReaderContext, RemoteState, ValidRemote, run_incoming_loop};

/// Transport-wide tunables.
#[derive(Clone, Copy, Debug)]
pub struct TransportConfig {
    /// Receive-side bound on length-prefixed payloads; hostile lengths are
    /// rejected before allocation.
    pub max_frame_bytes: usize,
    /// Bound on connection setup: dialing, the handshake, and waits on an
    /// unresolved remote.
    pub connect_timeout: Duration,
    /// Idle sleep of the nonblocking accept loop.
    pub accept_poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 4 * 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            accept_poll_interval: Duration::from_millis(25),
        }
    }
}

/// Process-wide transport root: owns the listening socket and every local
/// endpoint created on it.
pub struct TcpTransport {
    inner: Arc<TransportInner>,
}

pub(crate) struct TransportInner {
    host: String,
    /// Actual bound port in decimal; with service `"0"` this is the
    /// kernel-assigned port, so advertised addresses are always dialable.
    service: String,
    config: TransportConfig,
    state: Mutex<TransportState>,
    shutdown: AtomicBool,
}

enum TransportState {
    Valid(ValidTransport),
    Closed,
}

struct ValidTransport {
    endpoints: HashMap<EndPointAddr, Arc<LocalEndPoint>>,
    next_endpoint_id: i32,
    listener: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Bind `host:service` and start the accept loop.
    pub fn bind(host: &str, service: &str) -> Result<Self, TransportError> {
        Self::bind_with_config(host, service, TransportConfig::default())
    }

    pub fn bind_with_config(
        host: &str,
        service: &str,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        // Endpoint addresses derive from these parts; reject separators now
        // so address construction is infallible later.
        EndPointAddr::new(host, service, 0)?;
        let listener = TcpListener::bind(format!("{host}:{service}"))?;
        let service = listener.local_addr()?.port().to_string();
        listener.set_nonblocking(true)?;

        let inner = Arc::new(TransportInner {
            host: host.to_string(),
            service,
            config,
            state: Mutex::new(TransportState::Valid(ValidTransport {
                endpoints: HashMap::new(),
                next_endpoint_id: 0,
                listener: None,
            })),
            shutdown: AtomicBool::new(false),
        });

        let accept_inner = Arc::clone(&inner);
        let join = thread::spawn(move || run_accept_loop(listener, &accept_inner));
        {
            let mut state = inner.lock_state();
            if let TransportState::Valid(valid) = &mut *state {
                valid.listener = Some(join);
            }
        }
        tracing::info!(host = %inner.host, service = %inner.service, "transport listening");
        Ok(Self { inner })
    }

    /// Allocate the next endpoint id and register a fresh endpoint under
    /// `host:service:id`.
    pub fn new_endpoint(&self) -> Result<EndPoint, NewEndPointError> {
        let mut state = self.inner.lock_state();
        let TransportState::Valid(valid) = &mut *state else {
            return Err(NewEndPointError::TransportClosed);
        };
        let id = valid.next_endpoint_id;
        valid.next_endpoint_id += 1;
        let addr = self.inner.endpoint_addr(id);
        let (local, events) = LocalEndPoint::new(addr.clone(), self.inner.config);
        valid.endpoints.insert(addr, Arc::clone(&local));
        tracing::info!(addr = %local.addr, "endpoint created");
        Ok(EndPoint::new(Arc::clone(&self.inner), local, events))
    }

    /// Close every endpoint and stop the accept loop. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        let taken = {
            let mut state = self.inner.lock_state();
            match std::mem::replace(&mut *state, TransportState::Closed) {
                TransportState::Valid(valid) => Some(valid),
                TransportState::Closed => None,
            }
        };
        let Some(valid) = taken else {
            return;
        };
        for local in valid.endpoints.values() {
            shutdown_local_endpoint(local);
        }
        if let Some(listener) = valid.listener {
            let _ = listener.join();
        }
        tracing::info!(host = %self.inner.host, service = %self.inner.service, "transport closed");
    }
}

impl TransportInner {
    fn lock_state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Host and service were validated at bind; ids are allocated
    /// non-negative or checked by the caller.
    fn endpoint_addr(&self, endpoint_id: i32) -> EndPointAddr {
        EndPointAddr::from_validated(&self.host, &self.service, endpoint_id)
    }

    pub(crate) fn unlink_endpoint(&self, addr: &EndPointAddr) {
        let mut state = self.lock_state();
        if let TransportState::Valid(valid) = &mut *state {
            valid.endpoints.remove(addr);
        }
    }

    fn lookup_endpoint(&self, addr: &EndPointAddr) -> Option<Arc<LocalEndPoint>> {
        let state = self.lock_state();
        match &*state {
            TransportState::Valid(valid) => valid.endpoints.get(addr).cloned(),
            TransportState::Closed => None,
        }
    }

    /// Accept-loop termination handler: fan the failure out to every live
    /// endpoint, then retire the transport.
    fn fail(&self, reason: &str) {
        let taken = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, TransportState::Closed) {
                TransportState::Valid(valid) => Some(valid),
                TransportState::Closed => None,
            }
        };
        let Some(valid) = taken else {
            return;
        };
        for local in valid.endpoints.values() {
            local.post_event(Event::TransportFailed {
                reason: reason.to_string(),
            });
        }
    }
}

fn run_accept_loop(listener: TcpListener, inner: &Arc<TransportInner>) {
    loop {
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let inner = Arc::clone(inner);
                thread::spawn(move || {
                    if let Err(err) = handle_connection_request(&inner, stream) {
                        tracing::warn!("inbound connection request failed: {err}");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(inner.config.accept_poll_interval);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                tracing::error!("transport accept loop failed: {err}");
                inner.fail(&err.to_string());
                break;
            }
        }
    }
}

#[derive(Debug, Error)]
enum RequestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("handshake address invalid: {0}")]
    Addr(#[from] AddrError),
    #[error("handshake address is not utf-8")]
    AddrEncoding,
}

/// Inbound handshake: read the target endpoint id and the dialer's address,
/// route to the target endpoint, and resolve crossed attempts.
fn handle_connection_request(
    inner: &Arc<TransportInner>,
    stream: TcpStream,
) -> Result<(), RequestError> {
    stream.set_nodelay(true)?;
    // Bound the handshake; a slow dialer cannot pin this thread. The socket
    // options are shared with the cloned read half.
    stream.set_read_timeout(Some(inner.config.connect_timeout))?;

    let mut reader = FrameReader::new(stream.try_clone()?, inner.config.max_frame_bytes);
    let endpoint_id = reader.read_i32()?;
    let peer_bytes = reader.read_bytes()?;
    let peer = EndPointAddr::from_encoded(
        String::from_utf8(peer_bytes).map_err(|_| RequestError::AddrEncoding)?,
    )?;

    let local = (endpoint_id >= 0)
        .then(|| inner.endpoint_addr(endpoint_id))
        .and_then(|addr| inner.lookup_endpoint(&addr));
    let Some(local) = local else {
        let _ = frame::send_many(
            &mut (&stream),
            &[&encode_i32(ConnectionRequestResponse::Invalid.to_wire())],
        );
        let _ = stream.shutdown(Shutdown::Both);
        return Ok(());
    };

    let deadline = Instant::now() + inner.config.connect_timeout;
    match find_remote_incoming(&local, &peer, deadline) {
        IncomingDecision::Crossed => {
            let _ = frame::send_many(
                &mut (&stream),
                &[&encode_i32(ConnectionRequestResponse::Crossed.to_wire())],
            );
            let _ = stream.shutdown(Shutdown::Both);
            Ok(())
        }
        IncomingDecision::Reject => {
            // No response: the dialer observes the closed socket as a
            // connect failure.
            let _ = stream.shutdown(Shutdown::Both);
            Ok(())
        }
        IncomingDecision::Accept(remote) => {
            let ctx = ReaderContext {
                local: Arc::clone(&local),
                remote,
            };
            accept_remote(&ctx, stream, reader)
        }
    }
}

fn accept_remote(
    ctx: &ReaderContext,
    stream: TcpStream,
    mut reader: FrameReader<TcpStream>,
) -> Result<(), RequestError> {
    // The acceptance must hit the wire before the remote becomes Valid:
    // once Valid is published, other threads may write frames to the socket,
    // and nothing may precede the response code.
    let handshake = (|| -> Result<TcpStream, RequestError> {
        frame::send_many(
            &mut (&stream),
            &[&encode_i32(ConnectionRequestResponse::Accepted.to_wire())],
        )?;
        stream.set_read_timeout(None)?;
        Ok(stream.try_clone()?)
    })();

    match handshake {
        Ok(write_half) => {
            let published = {
                let mut cell = ctx.remote.lock_cell();
                if matches!(*cell, RemoteState::Init { .. }) {
                    *cell = RemoteState::Valid(ValidRemote::new(write_half));
                    ctx.remote.notify_resolved();
                    true
                } else {
                    // The endpoint went away between routing and acceptance.
                    false
                }
            };
            if !published {
                let _ = stream.shutdown(Shutdown::Both);
                return Ok(());
            }
            tracing::info!(peer = %ctx.remote.addr, "inbound connection accepted");
            run_incoming_loop(ctx, &mut reader);
            Ok(())
        }
        Err(err) => {
            let _ = stream.shutdown(Shutdown::Both);
            ctx.local.unlink(&ctx.remote);
            let mut cell = ctx.remote.lock_cell();
            if matches!(*cell, RemoteState::Init { .. }) {
                *cell = RemoteState::Invalid(ConnectError::Failed {
                    reason: err.to_string(),
                });
                ctx.remote.notify_resolved();
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_service_zero_publishes_the_real_port() {
        let transport = TcpTransport::bind("127.0.0.1", "0").expect("bind");
        let endpoint = transport.new_endpoint().expect("endpoint");
        assert_ne!(endpoint.address().service(), "0");
        assert_eq!(endpoint.address().endpoint_id(), 0);

        let second = transport.new_endpoint().expect("endpoint");
        assert_eq!(second.address().endpoint_id(), 1);
        transport.close();
    }

    #[test]
    fn close_is_idempotent_and_stops_new_endpoints() {
        let transport = TcpTransport::bind("127.0.0.1", "0").expect("bind");
        transport.close();
        transport.close();
        assert!(matches!(
            transport.new_endpoint(),
            Err(NewEndPointError::TransportClosed)
        ));
    }

    #[test]
    fn rejects_separator_in_host() {
        assert!(matches!(
            TcpTransport::bind("127.0.0.1:", "0"),
            Err(TransportError::Addr(_))
        ));
    }
}
