/*!
 * Endpoints
 * Transport-specific location strings for a participant's shared memory
 *
 * Every protocol shares the `<size>.<mailbox>.<max_mailboxes>` tail; the
 * address part in front of it is owned by the protocol codec.
 */

mod ofed;
mod pio;
mod socket;

pub use ofed::OfedAddress;
pub use pio::PioAddress;
pub use socket::SocketAddress;

use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::limits::MAX_MAILBOXES;
use crate::core::types::MailboxId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compiled-in transport protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Ofed,
    Socket,
    Pio,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Ofed, Protocol::Socket, Protocol::Pio];

    /// Endpoint string prefix, without the trailing ':'
    pub fn prefix(self) -> &'static str {
        match self {
            Protocol::Ofed => "ocpi-ofed-rdma",
            Protocol::Socket => "ocpi-socket-rdma",
            Protocol::Pio => "ocpi-smb-pio",
        }
    }

    /// Protocol named by an endpoint string's prefix
    pub fn of(endpoint: &str) -> DataplaneResult<Protocol> {
        let (prefix, _) = endpoint
            .split_once(':')
            .ok_or_else(|| DataplaneError::unsupported(endpoint, "missing protocol prefix"))?;
        Protocol::ALL
            .into_iter()
            .find(|p| p.prefix() == prefix)
            .ok_or_else(|| DataplaneError::unsupported(endpoint, "unknown protocol prefix"))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Protocol-specific part of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointAddress {
    Ofed(OfedAddress),
    Socket(SocketAddress),
    Pio(PioAddress),
}

impl EndpointAddress {
    pub fn protocol(&self) -> Protocol {
        match self {
            EndpointAddress::Ofed(_) => Protocol::Ofed,
            EndpointAddress::Socket(_) => Protocol::Socket,
            EndpointAddress::Pio(_) => Protocol::Pio,
        }
    }
}

/// Location of one participant's SMB
///
/// Built unfinalized (hardware fields zero) when local resources are being
/// created, then finalized once they exist. A finalized endpoint refuses every
/// mutation. Equality ignores the finalize state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    address: EndpointAddress,
    size: u64,
    mailbox: MailboxId,
    max_mailboxes: u16,
    finalized: bool,
}

impl Endpoint {
    pub fn new(
        address: EndpointAddress,
        size: u64,
        mailbox: MailboxId,
        max_mailboxes: u16,
    ) -> DataplaneResult<Self> {
        let endpoint = Self {
            address,
            size,
            mailbox,
            max_mailboxes,
            finalized: false,
        };
        endpoint.check_mailboxes()?;
        Ok(endpoint)
    }

    /// Parse an endpoint string; the field count must match exactly
    pub fn parse(s: &str) -> DataplaneResult<Self> {
        let protocol = Protocol::of(s)?;
        let body = &s[protocol.prefix().len() + 1..];
        let (address, tail) = match protocol {
            Protocol::Ofed => {
                let (addr, tail) = ofed::parse(s, body)?;
                (EndpointAddress::Ofed(addr), tail)
            }
            Protocol::Socket => {
                let (addr, tail) = socket::parse(s, body)?;
                (EndpointAddress::Socket(addr), tail)
            }
            Protocol::Pio => {
                let (addr, tail) = pio::parse(s, body)?;
                (EndpointAddress::Pio(addr), tail)
            }
        };
        let (size, mailbox, max_mailboxes) = parse_tail(s, tail)?;
        Self::new(address, size, mailbox, max_mailboxes)
    }

    /// Parse a string published by its owner; it is finalized on arrival
    pub fn parse_finalized(s: &str) -> DataplaneResult<Self> {
        let mut endpoint = Self::parse(s)?;
        endpoint.finalized = true;
        Ok(endpoint)
    }

    fn check_mailboxes(&self) -> DataplaneResult<()> {
        if self.max_mailboxes == 0 || self.max_mailboxes as usize > MAX_MAILBOXES {
            return Err(DataplaneError::unsupported(
                self.to_string(),
                format!("max mailboxes must be between 1 and {}", MAX_MAILBOXES),
            ));
        }
        if self.mailbox >= self.max_mailboxes {
            return Err(DataplaneError::unsupported(
                self.to_string(),
                "mailbox id must be below max mailboxes",
            ));
        }
        Ok(())
    }

    fn ensure_mutable(&self) -> DataplaneResult<()> {
        if self.finalized {
            return Err(DataplaneError::EndpointFinalized {
                endpoint: self.to_string(),
            });
        }
        Ok(())
    }

    /// Freeze the endpoint once its local resources exist
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn ensure_finalized(&self) -> DataplaneResult<()> {
        if !self.finalized {
            return Err(DataplaneError::EndpointNotFinalized {
                endpoint: self.to_string(),
            });
        }
        Ok(())
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.address.protocol()
    }

    #[inline]
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn mailbox(&self) -> MailboxId {
        self.mailbox
    }

    #[inline]
    pub fn max_mailboxes(&self) -> u16 {
        self.max_mailboxes
    }

    /// Replace the protocol address before finalize
    pub fn set_address(&mut self, address: EndpointAddress) -> DataplaneResult<()> {
        self.ensure_mutable()?;
        if address.protocol() != self.protocol() {
            return Err(DataplaneError::unsupported(
                self.to_string(),
                format!("cannot change protocol to {}", address.protocol()),
            ));
        }
        self.address = address;
        Ok(())
    }

    /// Record the hardware-assigned RDMA fields before finalize
    pub fn set_ofed_hardware(
        &mut self,
        lid: u16,
        gid: (u64, u64),
        psn: u32,
        rkey: u32,
        vaddr: u64,
    ) -> DataplaneResult<()> {
        self.ensure_mutable()?;
        match &mut self.address {
            EndpointAddress::Ofed(addr) => {
                addr.lid = lid;
                addr.gid_hi = gid.0;
                addr.gid_lo = gid.1;
                addr.psn = psn;
                addr.rkey = rkey;
                addr.vaddr = vaddr;
                Ok(())
            }
            _ => Err(DataplaneError::unsupported(self.to_string(), "not an RDMA endpoint")),
        }
    }

    /// Record the port a socket listener actually bound
    pub fn set_socket_port(&mut self, port: u16) -> DataplaneResult<()> {
        self.ensure_mutable()?;
        match &mut self.address {
            EndpointAddress::Socket(addr) => {
                addr.port = port;
                Ok(())
            }
            _ => Err(DataplaneError::unsupported(self.to_string(), "not a socket endpoint")),
        }
    }

    /// Both endpoints name the same physical memory
    pub fn same_location(&self, other: &Endpoint) -> bool {
        self.address == other.address
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.size == other.size
            && self.mailbox == other.mailbox
            && self.max_mailboxes == other.max_mailboxes
    }
}

impl Eq for Endpoint {}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            EndpointAddress::Ofed(addr) => ofed::encode(addr, f)?,
            EndpointAddress::Socket(addr) => socket::encode(addr, f)?,
            EndpointAddress::Pio(addr) => pio::encode(addr, f)?,
        }
        write!(f, "{}.{}.{}", self.size, self.mailbox, self.max_mailboxes)
    }
}

impl std::str::FromStr for Endpoint {
    type Err = DataplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

/// `<size>.<mailbox>.<max_mailboxes>`
fn parse_tail(full: &str, tail: &str) -> DataplaneResult<(u64, MailboxId, u16)> {
    let fields: Vec<&str> = tail.split('.').collect();
    if fields.len() != 3 {
        return Err(DataplaneError::unsupported(
            full,
            format!("expected <size>.<mailbox>.<max>, found {} fields", fields.len()),
        ));
    }
    Ok((
        parse_field(full, "size", fields[0])?,
        parse_field(full, "mailbox", fields[1])?,
        parse_field(full, "max mailboxes", fields[2])?,
    ))
}

pub(crate) fn parse_field<T: std::str::FromStr>(full: &str, name: &str, raw: &str) -> DataplaneResult<T> {
    raw.parse::<T>()
        .map_err(|_| DataplaneError::unsupported(full, format!("invalid {} '{}'", name, raw)))
}
