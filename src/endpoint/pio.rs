/*!
 * PIO Endpoint Codec
 * `ocpi-smb-pio:<name>:<size>.<mailbox>.<max>`
 */

use crate::core::errors::{DataplaneError, DataplaneResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a host-local shared region
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PioAddress {
    pub name: String,
}

pub(super) fn parse<'a>(full: &str, body: &'a str) -> DataplaneResult<(PioAddress, &'a str)> {
    let (name, tail) = body
        .split_once(':')
        .ok_or_else(|| DataplaneError::unsupported(full, "expected <name>:<size>.<mailbox>.<max>"))?;
    if name.is_empty() || tail.contains(':') {
        return Err(DataplaneError::unsupported(full, "malformed region name"));
    }
    Ok((
        PioAddress {
            name: name.to_string(),
        },
        tail,
    ))
}

pub(super) fn encode(addr: &PioAddress, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ocpi-smb-pio:{}:", addr.name)
}
