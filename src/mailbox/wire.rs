/*!
 * Mailbox Wire Layout
 * `#[repr(C)]` structures shared byte-for-byte between participants
 */

use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::limits::{COMMS_UP_AND_RUNNING, MAX_MAILBOXES, MAX_URL_LEN, SMB_ALIGNMENT};
use crate::core::types::{CircuitId, MailboxId, Offset, PortOrdinal};
use crate::endpoint::Endpoint;
use crate::smb::{Region, ResourceAllocator};
use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Offset of the comms block in every SMB
pub const COMMS_OFFSET: Offset = 0;

/// Request discriminant stored in `MailboxSlot::request_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum RequestType {
    NoRequest = 0,
    /// Real input asks for the producer-side shadow state offsets
    ReqShadowRstateOffset = 1,
    /// Shadow input asks for the real input's buffer offsets
    ReqInputOffsets = 2,
    /// Shadow output asks for the output port-set control offset
    ReqOutputControlOffset = 3,
}

impl RequestType {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(RequestType::NoRequest),
            1 => Some(RequestType::ReqShadowRstateOffset),
            2 => Some(RequestType::ReqInputOffsets),
            3 => Some(RequestType::ReqOutputControlOffset),
            _ => None,
        }
    }
}

/// One participant's request slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct MailboxSlot {
    pub request_type: u32,
    pub error_code: i32,
    pub circuit_id: u32,
    pub port_id: u32,
    /// Requester's endpoint (or the shadow's endpoint for control requests)
    pub url: [u8; MAX_URL_LEN],
    pub return_offset: u64,
    pub return_size: u64,
    pub return_mailbox: u16,
    pub _pad: [u8; 6],
}

impl MailboxSlot {
    /// Bytes covered by the header copy (`request_type`, `error_code`)
    pub const HEADER_LEN: u64 = 8;

    pub fn empty() -> Self {
        Self::new_zeroed()
    }

    pub fn request(
        request_type: RequestType,
        circuit_id: CircuitId,
        port_id: PortOrdinal,
        url: &str,
        return_offset: Offset,
        return_size: u64,
        return_mailbox: MailboxId,
    ) -> DataplaneResult<Self> {
        let mut slot = Self::new_zeroed();
        slot.request_type = request_type as u32;
        slot.circuit_id = circuit_id;
        slot.port_id = port_id;
        slot.set_url(url)?;
        slot.return_offset = return_offset;
        slot.return_size = return_size;
        slot.return_mailbox = return_mailbox;
        Ok(slot)
    }

    pub fn request_type(&self) -> Option<RequestType> {
        RequestType::from_wire(self.request_type)
    }

    pub fn is_empty(&self) -> bool {
        self.request_type == RequestType::NoRequest as u32
    }

    fn set_url(&mut self, url: &str) -> DataplaneResult<()> {
        let bytes = url.as_bytes();
        // Leave room for the terminating zero
        if bytes.len() >= MAX_URL_LEN {
            return Err(DataplaneError::unsupported(
                url,
                format!("endpoint longer than {} bytes cannot be mailed", MAX_URL_LEN - 1),
            ));
        }
        self.url = [0; MAX_URL_LEN];
        self.url[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn url(&self) -> DataplaneResult<&str> {
        let end = self.url.iter().position(|&b| b == 0).unwrap_or(MAX_URL_LEN);
        std::str::from_utf8(&self.url[..end])
            .map_err(|_| DataplaneError::unsupported("<mailbox>", "endpoint is not valid UTF-8"))
    }
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct CommsHeader {
    up_and_running: u32,
    max_mailboxes: u32,
}

/// Layout of the comms block at [`COMMS_OFFSET`]
pub struct ContainerComms;

impl ContainerComms {
    /// Size of the block in bytes
    pub const fn size() -> u64 {
        (std::mem::size_of::<CommsHeader>() + MAX_MAILBOXES * std::mem::size_of::<MailboxSlot>())
            as u64
    }

    /// Offset of slot `mailbox`; identical in every participant's SMB
    pub fn slot_offset(mailbox: MailboxId) -> DataplaneResult<Offset> {
        if mailbox as usize >= MAX_MAILBOXES {
            return Err(DataplaneError::invalid_state(format!(
                "mailbox {} out of range",
                mailbox
            )));
        }
        Ok(COMMS_OFFSET
            + std::mem::size_of::<CommsHeader>() as u64
            + mailbox as u64 * std::mem::size_of::<MailboxSlot>() as u64)
    }

    /// Reserve and initialise the block in a fresh SMB
    pub fn install(
        region: &Region,
        allocator: &ResourceAllocator,
        endpoint: &Endpoint,
    ) -> DataplaneResult<()> {
        let offset = allocator.alloc(Self::size(), SMB_ALIGNMENT)?;
        if offset != COMMS_OFFSET {
            return Err(DataplaneError::invalid_state(format!(
                "comms block of {} landed at offset {}",
                endpoint, offset
            )));
        }
        region.fill(COMMS_OFFSET, Self::size(), 0)?;
        region.write(
            COMMS_OFFSET,
            &CommsHeader {
                up_and_running: COMMS_UP_AND_RUNNING,
                max_mailboxes: endpoint.max_mailboxes() as u32,
            },
        )
    }

    pub fn is_up(region: &Region) -> DataplaneResult<bool> {
        let header: CommsHeader = region.read(COMMS_OFFSET)?;
        Ok(header.up_and_running == COMMS_UP_AND_RUNNING)
    }

    pub fn read_slot(region: &Region, mailbox: MailboxId) -> DataplaneResult<MailboxSlot> {
        region.read(Self::slot_offset(mailbox)?)
    }

    pub fn write_slot(region: &Region, mailbox: MailboxId, slot: &MailboxSlot) -> DataplaneResult<()> {
        region.write(Self::slot_offset(mailbox)?, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_slot_layout_has_no_padding() {
        assert_eq!(std::mem::size_of::<MailboxSlot>(), 168);
        assert_eq!(std::mem::offset_of!(MailboxSlot, url), 16);
        assert_eq!(std::mem::offset_of!(MailboxSlot, return_offset), 144);
        assert_eq!(std::mem::offset_of!(MailboxSlot, return_mailbox), 160);
    }

    #[test]
    fn test_slot_url_round_trip() {
        let slot = MailboxSlot::request(
            RequestType::ReqInputOffsets,
            7,
            2,
            "ocpi-smb-pio:a:65536.1.2",
            4096,
            32,
            1,
        )
        .unwrap();
        assert_eq!(slot.url().unwrap(), "ocpi-smb-pio:a:65536.1.2");
        assert_eq!(slot.request_type(), Some(RequestType::ReqInputOffsets));
        assert!(!slot.is_empty());
    }

    #[test]
    fn test_url_too_long() {
        let long = "x".repeat(MAX_URL_LEN);
        assert!(MailboxSlot::request(RequestType::ReqInputOffsets, 1, 1, &long, 0, 0, 0).is_err());
    }

    #[test]
    fn test_install_reserves_offset_zero() {
        let endpoint = Endpoint::parse("ocpi-smb-pio:comms:65536.0.4").unwrap();
        let region = Region::new(65536);
        let allocator = ResourceAllocator::new("comms", 65536);
        ContainerComms::install(&region, &allocator, &endpoint).unwrap();

        assert!(ContainerComms::is_up(&region).unwrap());
        assert!(allocator.alloc(8, 8).unwrap() >= ContainerComms::size());
        assert!(ContainerComms::read_slot(&region, 3).unwrap().is_empty());
        assert!(ContainerComms::slot_offset(MAX_MAILBOXES as MailboxId).is_err());
    }
}
