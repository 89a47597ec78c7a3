//! Wire protocol vocabulary (control headers, handshake responses).

/// Connection ids below this value are reserved for control headers.
pub const FIRST_NON_RESERVED_CONNECTION_ID: i32 = 1024;

/// Control frame discriminator, sent as an `i32` below the reserved bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlHeader {
    RequestConnectionId,
    CloseConnection,
    ControlResponse,
    CloseSocket,
}

impl ControlHeader {
    pub fn to_wire(self) -> i32 {
        match self {
            ControlHeader::RequestConnectionId => 0,
            ControlHeader::CloseConnection => 1,
            ControlHeader::ControlResponse => 2,
            ControlHeader::CloseSocket => 3,
        }
    }

    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(ControlHeader::RequestConnectionId),
            1 => Some(ControlHeader::CloseConnection),
            2 => Some(ControlHeader::ControlResponse),
            3 => Some(ControlHeader::CloseSocket),
            _ => None,
        }
    }
}

/// Listener's verdict on an inbound connection request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionRequestResponse {
    Accepted,
    Invalid,
    Crossed,
}

impl ConnectionRequestResponse {
    pub fn to_wire(self) -> i32 {
        match self {
            ConnectionRequestResponse::Accepted => 0,
            ConnectionRequestResponse::Invalid => 1,
            ConnectionRequestResponse::Crossed => 2,
        }
    }

    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(ConnectionRequestResponse::Accepted),
            1 => Some(ConnectionRequestResponse::Invalid),
            2 => Some(ConnectionRequestResponse::Crossed),
            _ => None,
        }
    }
}
