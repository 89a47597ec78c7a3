#![forbid(unsafe_code)]

//! Reliable, bidirectional message transport that multiplexes lightweight
//! logical connections over a single TCP socket per endpoint pair.
//!
//! A [`TcpTransport`] owns one listening socket and any number of local
//! endpoints. Endpoints open logical connections to remote endpoints, send
//! framed byte messages, and consume an ordered event stream. Between any
//! two endpoints at most one physical socket exists in either direction;
//! simultaneous connection attempts are resolved by a deterministic address
//! tiebreak, and the socket is retired through a two-way close negotiation
//! that cannot race a concurrent reuse.

pub mod addr;
mod connection;
mod endpoint;
pub mod error;
pub mod event;
mod frame;
mod proto;
mod remote;
mod transport;

pub use addr::{AddrError, EndPointAddr};
pub use connection::Connection;
pub use endpoint::{ConnectHints, EndPoint};
pub use error::{ConnectError, NewEndPointError, SendError, TransportError};
pub use event::{ConnectionId, Event, Reliability};
pub use transport::{TcpTransport, TransportConfig};
