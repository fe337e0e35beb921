/*!
 * Transfer Drivers
 * One-sided copy backends behind a uniform request contract
 *
 * Backends are compiled in and registered explicitly in a [`DriverRegistry`];
 * each one turns an endpoint into SMB services and a pair of SMB services into
 * a connection that accumulates, posts and polls copy requests.
 */

pub mod local;
pub mod ofed;
pub mod pio;
pub mod registry;
pub mod socket;
mod traits;
mod types;

pub use local::LocalCopyServices;
pub use registry::DriverRegistry;
pub use traits::{TransferDriver, XferRequest, XferServices};
pub use types::{posting_order, CompletionStatus, CopyOp, XferFlags};

/// Backend-owned state attached to an SMB, released with it
pub enum SmemBackend {
    /// Attached remote SMB; nothing to release
    Remote,
    Pio(pio::PioRegistration),
    Socket(socket::SocketServer),
    Ofed(ofed::OfedSmem),
}

impl SmemBackend {
    pub fn name(&self) -> &'static str {
        match self {
            SmemBackend::Remote => "remote",
            SmemBackend::Pio(_) => "pio",
            SmemBackend::Socket(_) => "socket",
            SmemBackend::Ofed(_) => "ofed",
        }
    }
}

/// Spin on a posted request until it leaves `Pending`
///
/// Only used for short control transfers (mailbox traffic); buffer transfers
/// are polled by the owning circuit instead.
pub fn wait_for_completion(
    request: &mut dyn XferRequest,
    spin_limit: u32,
) -> crate::core::errors::DataplaneResult<CompletionStatus> {
    let mut spins = 0u32;
    loop {
        let status = request.status()?;
        if status.is_done() {
            return Ok(status);
        }
        spins += 1;
        if spins >= spin_limit {
            return Err(crate::core::errors::DataplaneError::invalid_state(format!(
                "transfer still pending after {} polls",
                spins
            )));
        }
        std::thread::yield_now();
    }
}
