/*!
 * Mailbox Protocol
 * Fixed-format offset requests exchanged through per-participant slots
 *
 * Every local SMB starts with a container comms block holding one slot per
 * participant. A requester fills its own slot, then copies it to the same
 * offset in the target's SMB. The target answers by copying offsets to the
 * requester and copying its cleared slot back, which frees the requester's
 * mailbox for the next request.
 */

mod request;
mod wire;

pub use request::{
    XferMailbox, MAILBOX_COPY_FAILED, MAILBOX_NO_SUCH_PORT, MAILBOX_UNKNOWN_REQUEST,
};
pub use wire::{ContainerComms, MailboxSlot, RequestType, COMMS_OFFSET};
