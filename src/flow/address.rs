//! Client/server endpoint pair carried with every flow.
//!
//! On the wire and in the ring header each field is a fixed-width,
//! NUL-padded string: client address, client port, server address, server
//! port. Values longer than their field are truncated (one byte is always
//! kept for the terminator).

use crate::constants::{ADDRESS_PAIR_LEN, CLIENT_ADDR_LEN, PORT_LEN, SERVER_ADDR_LEN};
use crate::error::ControlError;
use std::fmt;

const FIELD_WIDTHS: [usize; 4] = [CLIENT_ADDR_LEN, PORT_LEN, SERVER_ADDR_LEN, PORT_LEN];

/// Endpoints of one relayed flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressPair {
    pub client_address: String,
    pub client_port: String,
    pub server_address: String,
    pub server_port: String,
}

impl AddressPair {
    pub fn new(
        client_address: impl Into<String>,
        client_port: impl Into<String>,
        server_address: impl Into<String>,
        server_port: impl Into<String>,
    ) -> Self {
        Self {
            client_address: client_address.into(),
            client_port: client_port.into(),
            server_address: server_address.into(),
            server_port: server_port.into(),
        }
    }

    /// Build from two `host:port` strings. IPv6 hosts may be bracketed.
    pub fn from_endpoints(client: &str, server: &str) -> Result<Self, ControlError> {
        let (client_address, client_port) = split_endpoint(client)?;
        let (server_address, server_port) = split_endpoint(server)?;
        Ok(Self::new(client_address, client_port, server_address, server_port))
    }

    /// `host:port` of the server, suitable for a socket connect
    pub fn server_endpoint(&self) -> String {
        join_endpoint(&self.server_address, &self.server_port)
    }

    pub fn client_endpoint(&self) -> String {
        join_endpoint(&self.client_address, &self.client_port)
    }

    /// True when no server has been stamped yet
    pub fn is_unset(&self) -> bool {
        self.server_address.is_empty()
    }

    /// Write the fixed-width encoding into `out`
    pub fn encode_into(&self, out: &mut [u8; ADDRESS_PAIR_LEN]) {
        let fields = [
            &self.client_address,
            &self.client_port,
            &self.server_address,
            &self.server_port,
        ];
        let mut offset = 0;
        for (field, width) in fields.iter().zip(FIELD_WIDTHS) {
            let slot = &mut out[offset..offset + width];
            slot.fill(0);
            let bytes = truncated(field, width - 1);
            slot[..bytes.len()].copy_from_slice(bytes);
            offset += width;
        }
    }

    pub fn encode(&self) -> [u8; ADDRESS_PAIR_LEN] {
        let mut out = [0u8; ADDRESS_PAIR_LEN];
        self.encode_into(&mut out);
        out
    }

    /// Decode the fixed-width encoding; `bytes` must be exactly one record
    pub fn decode(bytes: &[u8]) -> Result<Self, ControlError> {
        if bytes.len() != ADDRESS_PAIR_LEN {
            return Err(ControlError::InvalidLength {
                expected: ADDRESS_PAIR_LEN,
                actual: bytes.len(),
            });
        }
        let mut fields = Vec::with_capacity(4);
        let mut offset = 0;
        for width in FIELD_WIDTHS {
            let slot = &bytes[offset..offset + width];
            let end = slot.iter().position(|&b| b == 0).unwrap_or(width);
            let text = std::str::from_utf8(&slot[..end]).map_err(|_| ControlError::InvalidAddress)?;
            fields.push(text.to_string());
            offset += width;
        }
        let mut fields = fields.into_iter();
        Ok(Self {
            client_address: fields.next().unwrap_or_default(),
            client_port: fields.next().unwrap_or_default(),
            server_address: fields.next().unwrap_or_default(),
            server_port: fields.next().unwrap_or_default(),
        })
    }
}

impl fmt::Display for AddressPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.client_endpoint(), self.server_endpoint())
    }
}

fn split_endpoint(endpoint: &str) -> Result<(&str, &str), ControlError> {
    let (host, port) = endpoint.rsplit_once(':').ok_or(ControlError::InvalidAddress)?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if port.is_empty() || port.parse::<u16>().is_err() {
        return Err(ControlError::InvalidAddress);
    }
    Ok((host, port))
}

fn join_endpoint(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a character
fn truncated(s: &str, max: usize) -> &[u8] {
    if s.len() <= max {
        return s.as_bytes();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s.as_bytes()[..end]
}
