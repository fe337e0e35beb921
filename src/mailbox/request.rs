/*!
 * Mailbox Requests
 * Posting a request into a peer's slot and answering requests addressed to us
 */

use super::wire::{ContainerComms, MailboxSlot};
use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::types::MailboxId;
use crate::smb::SmbResources;
use crate::xfer::{wait_for_completion, CompletionStatus, XferFlags, XferServices};
use tracing::debug;

/// Error codes a responder writes into a requester's cleared slot
pub const MAILBOX_UNKNOWN_REQUEST: i32 = -1;
pub const MAILBOX_NO_SUCH_PORT: i32 = -2;
pub const MAILBOX_COPY_FAILED: i32 = -3;

/// One participant's mailbox
///
/// The slot is a single-writer resource: a new request may only be written
/// while [`is_available`](Self::is_available) holds.
#[derive(Debug, Clone, Copy)]
pub struct XferMailbox {
    mailbox: MailboxId,
}

impl XferMailbox {
    pub fn new(mailbox: MailboxId) -> Self {
        Self { mailbox }
    }

    #[inline]
    pub fn id(&self) -> MailboxId {
        self.mailbox
    }

    /// True when our own slot holds no outstanding request
    pub fn is_available(&self, local: &SmbResources) -> DataplaneResult<bool> {
        Ok(ContainerComms::read_slot(local.region()?, self.mailbox)?.is_empty())
    }

    /// Cleared slot the peer left behind when it rejected our last request
    ///
    /// The slot keeps the rejected request's circuit and port next to the
    /// error code. Taking it resets the code, so each rejection is reported once.
    pub fn take_rejection(&self, local: &SmbResources) -> DataplaneResult<Option<MailboxSlot>> {
        let region = local.region()?;
        let slot = ContainerComms::read_slot(region, self.mailbox)?;
        if !slot.is_empty() || slot.error_code == 0 {
            return Ok(None);
        }
        ContainerComms::write_slot(region, self.mailbox, &MailboxSlot::empty())?;
        Ok(Some(slot))
    }

    /// Write `slot` into our slot and copy it to the same slot in the target SMB
    ///
    /// The body goes first and the header last, so the target never sees a
    /// request type before the fields it describes.
    pub fn make_request(
        &self,
        local: &SmbResources,
        services: &dyn XferServices,
        slot: &MailboxSlot,
        spin_limit: u32,
    ) -> DataplaneResult<()> {
        ContainerComms::write_slot(local.region()?, self.mailbox, slot)?;
        copy_slot(services, self.mailbox, spin_limit)?;
        debug!(
            mailbox = self.mailbox,
            target = %services.target().key(),
            request = slot.request_type,
            circuit = slot.circuit_id,
            port = slot.port_id,
            "Mailbox request sent"
        );
        Ok(())
    }

    /// Clear slot `requester` locally and copy the cleared slot back to the requester
    ///
    /// The cleared slot names the circuit and port of the `answered` request.
    pub fn clear_remote(
        local: &SmbResources,
        services: &dyn XferServices,
        requester: MailboxId,
        answered: &MailboxSlot,
        error_code: i32,
        spin_limit: u32,
    ) -> DataplaneResult<()> {
        let mut cleared = MailboxSlot::empty();
        cleared.error_code = error_code;
        cleared.circuit_id = answered.circuit_id;
        cleared.port_id = answered.port_id;
        ContainerComms::write_slot(local.region()?, requester, &cleared)?;
        copy_slot(services, requester, spin_limit)
    }

    /// Drop the request in slot `requester` without answering it
    pub fn discard(local: &SmbResources, requester: MailboxId) -> DataplaneResult<()> {
        let mut cleared = MailboxSlot::empty();
        cleared.error_code = MAILBOX_UNKNOWN_REQUEST;
        ContainerComms::write_slot(local.region()?, requester, &cleared)
    }
}

fn copy_slot(services: &dyn XferServices, mailbox: MailboxId, spin_limit: u32) -> DataplaneResult<()> {
    let offset = ContainerComms::slot_offset(mailbox)?;
    let body_len = std::mem::size_of::<MailboxSlot>() as u64 - MailboxSlot::HEADER_LEN;

    let mut request = services.create_request()?;
    request.copy(
        offset + MailboxSlot::HEADER_LEN,
        offset + MailboxSlot::HEADER_LEN,
        body_len,
        XferFlags::FIRST_TRANSFER,
    )?;
    request.copy(
        offset,
        offset,
        MailboxSlot::HEADER_LEN,
        XferFlags::FLAG_TRANSFER | XferFlags::LAST_TRANSFER,
    )?;
    request.post()?;

    match wait_for_completion(request.as_mut(), spin_limit)? {
        CompletionStatus::CompleteSuccess => Ok(()),
        _ => Err(DataplaneError::api(
            "mailbox_post",
            format!("slot {} copy to {} failed", mailbox, services.target().key()),
        )),
    }
}
