/*!
 * Socket Endpoint Codec
 * `ocpi-socket-rdma:<host>:<port>;<size>.<mailbox>.<max>`
 */

use super::parse_field;
use crate::core::errors::{DataplaneError, DataplaneResult};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketAddress {
    pub host: String,
    pub port: u16,
}

impl SocketAddress {
    /// `host:port` suitable for `ToSocketAddrs`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub(super) fn parse<'a>(full: &str, body: &'a str) -> DataplaneResult<(SocketAddress, &'a str)> {
    let (addr, tail) = body
        .split_once(';')
        .ok_or_else(|| DataplaneError::unsupported(full, "missing ';' before size"))?;
    // Last ':' so bracketed IPv6 hosts keep their colons
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| DataplaneError::unsupported(full, "expected <host>:<port>"))?;
    if host.is_empty() {
        return Err(DataplaneError::unsupported(full, "empty host"));
    }
    Ok((
        SocketAddress {
            host: host.to_string(),
            port: parse_field(full, "port", port)?,
        },
        tail,
    ))
}

pub(super) fn encode(addr: &SocketAddress, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ocpi-socket-rdma:{}:{};", addr.host, addr.port)
}
