/*!
 * Transfer Traits
 * Uniform copy/post/poll contract implemented by every backend
 */

use super::types::{CompletionStatus, XferFlags};
use crate::core::config::TransportConfig;
use crate::core::errors::DataplaneResult;
use crate::core::types::{MailboxId, Offset};
use crate::endpoint::{Endpoint, Protocol};
use crate::smb::SmemServices;
use std::sync::Arc;

/// A batch of one-sided copies between the two SMBs of a connection
pub trait XferRequest: Send {
    /// Queue a copy of `len` bytes from `src` (source SMB) to `dst` (target SMB)
    fn copy(&mut self, src: Offset, dst: Offset, len: u64, flags: XferFlags) -> DataplaneResult<()>;

    /// Hand every queued copy to the backend
    fn post(&mut self) -> DataplaneResult<()>;

    /// Poll progress; never blocks beyond one short retry
    fn status(&mut self) -> DataplaneResult<CompletionStatus>;

    /// Number of copies accumulated so far
    fn copy_count(&self) -> usize;
}

/// Connection scoped to one ordered (source, target) SMB pair
pub trait XferServices: Send + Sync {
    fn source(&self) -> &Arc<SmemServices>;

    fn target(&self) -> &Arc<SmemServices>;

    fn create_request(&self) -> DataplaneResult<Box<dyn XferRequest>>;

    /// Identifier the peer needs to complete the handshake
    fn connection_cookie(&self) -> u64 {
        0
    }

    /// Complete the handshake with the peer's cookie
    fn finalize(&self, _cookie: u64) -> DataplaneResult<()> {
        Ok(())
    }

    fn is_finalized(&self) -> bool {
        true
    }

    /// Advance an out-of-band handshake; true once the connection can carry requests
    fn poll_handshake(&self) -> DataplaneResult<bool> {
        Ok(self.is_finalized())
    }
}

/// Pluggable backend registered in a [`DriverRegistry`](super::DriverRegistry)
pub trait TransferDriver: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Unfinalized endpoint for a new local SMB
    fn allocate_endpoint(
        &self,
        config: &TransportConfig,
        mailbox: MailboxId,
        max_mailboxes: u16,
    ) -> DataplaneResult<Endpoint>;

    /// Create (local) or attach to (remote) the SMB behind `endpoint`
    ///
    /// A local SMB comes back with a finalized endpoint carrying any
    /// hardware-assigned fields.
    fn connect(
        &self,
        endpoint: &Endpoint,
        local: bool,
        config: &TransportConfig,
    ) -> DataplaneResult<Arc<SmemServices>>;

    /// Connection from a local source SMB to any target SMB
    fn create_connection(
        &self,
        source: &Arc<SmemServices>,
        target: &Arc<SmemServices>,
    ) -> DataplaneResult<Arc<dyn XferServices>>;

    /// Remote endpoints that started a handshake towards `local`
    fn pending_handshakes(&self, _local: &SmemServices) -> Vec<String> {
        Vec::new()
    }
}
