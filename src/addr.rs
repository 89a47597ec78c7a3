//! Endpoint addressing (`host:service:endpoint-id`).

use std::fmt;

use thiserror::Error;

/// Invalid endpoint address.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddrError {
    #[error("address `{raw}` is not host:service:endpoint-id")]
    Malformed { raw: String },
    #[error("address host `{raw}` contains `:`")]
    HostSeparator { raw: String },
    #[error("address service `{raw}` contains `:`")]
    ServiceSeparator { raw: String },
    #[error("endpoint id `{raw}` is not a non-negative 32-bit integer")]
    EndPointId { raw: String },
}

/// Wire-form endpoint address.
///
/// Two addresses compare by the byte order of their encoded form, which is
/// what the crossed-connect tiebreak relies on: both sides of a simultaneous
/// connect evaluate the same comparison and reach the same verdict.
#[derive(Clone)]
pub struct EndPointAddr {
    encoded: String,
    host: String,
    service: String,
    endpoint_id: i32,
}

impl EndPointAddr {
    pub fn new(host: &str, service: &str, endpoint_id: i32) -> Result<Self, AddrError> {
        if host.contains(':') {
            return Err(AddrError::HostSeparator {
                raw: host.to_string(),
            });
        }
        if service.contains(':') {
            return Err(AddrError::ServiceSeparator {
                raw: service.to_string(),
            });
        }
        if endpoint_id < 0 {
            return Err(AddrError::EndPointId {
                raw: endpoint_id.to_string(),
            });
        }
        Ok(Self {
            encoded: format!("{host}:{service}:{endpoint_id}"),
            host: host.to_string(),
            service: service.to_string(),
            endpoint_id,
        })
    }

    /// Parse an address from its encoded wire form.
    pub fn from_encoded(raw: impl Into<String>) -> Result<Self, AddrError> {
        let raw = raw.into();
        let mut parts = raw.split(':');
        let (Some(host), Some(service), Some(id), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AddrError::Malformed { raw });
        };
        let endpoint_id = id
            .parse::<i32>()
            .ok()
            .filter(|id| *id >= 0)
            .ok_or_else(|| AddrError::EndPointId {
                raw: id.to_string(),
            })?;
        Ok(Self {
            host: host.to_string(),
            service: service.to_string(),
            endpoint_id,
            encoded: raw,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.encoded.as_bytes()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn endpoint_id(&self) -> i32 {
        self.endpoint_id
    }

    /// `host:service` pair accepted by `TcpStream::connect`.
    pub(crate) fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.service)
    }

    /// Construct from parts the caller already validated (no `:` in host or
    /// service, id non-negative).
    pub(crate) fn from_validated(host: &str, service: &str, endpoint_id: i32) -> Self {
        debug_assert!(!host.contains(':') && !service.contains(':') && endpoint_id >= 0);
        Self {
            encoded: format!("{host}:{service}:{endpoint_id}"),
            host: host.to_string(),
            service: service.to_string(),
            endpoint_id,
        }
    }
}

impl PartialEq for EndPointAddr {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for EndPointAddr {}

impl std::hash::Hash for EndPointAddr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.encoded.hash(state);
    }
}

impl PartialOrd for EndPointAddr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EndPointAddr {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.encoded.as_bytes().cmp(other.encoded.as_bytes())
    }
}

impl fmt::Debug for EndPointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndPointAddr({:?})", self.encoded)
    }
}

impl fmt::Display for EndPointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_encoded_form() {
        let addr = EndPointAddr::new("127.0.0.1", "9001", 3).unwrap();
        assert_eq!(addr.as_str(), "127.0.0.1:9001:3");

        let parsed = EndPointAddr::from_encoded(addr.as_str()).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(parsed.host(), "127.0.0.1");
        assert_eq!(parsed.service(), "9001");
        assert_eq!(parsed.endpoint_id(), 3);
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(matches!(
            EndPointAddr::from_encoded("localhost:80"),
            Err(AddrError::Malformed { .. })
        ));
        assert!(matches!(
            EndPointAddr::from_encoded("a:b:c:d"),
            Err(AddrError::Malformed { .. })
        ));
        assert!(matches!(
            EndPointAddr::from_encoded("localhost:80:-1"),
            Err(AddrError::EndPointId { .. })
        ));
        assert!(matches!(
            EndPointAddr::from_encoded("localhost:80:x"),
            Err(AddrError::EndPointId { .. })
        ));
        assert!(matches!(
            EndPointAddr::new("a:b", "80", 0),
            Err(AddrError::HostSeparator { .. })
        ));
        assert!(matches!(
            EndPointAddr::new("a", "8:0", 0),
            Err(AddrError::ServiceSeparator { .. })
        ));
        assert!(matches!(
            EndPointAddr::new("a", "80", -5),
            Err(AddrError::EndPointId { .. })
        ));
    }

    #[test]
    fn orders_by_encoded_bytes() {
        let a = EndPointAddr::new("127.0.0.1", "9001", 0).unwrap();
        let b = EndPointAddr::new("127.0.0.1", "9001", 1).unwrap();
        let c = EndPointAddr::new("127.0.0.1", "9001", 10).unwrap();
        assert!(a < b);
        // Lexicographic, not numeric: "1" < "10" < "2".
        assert!(b < c);
        assert!(c < EndPointAddr::new("127.0.0.1", "9001", 2).unwrap());
    }
}
