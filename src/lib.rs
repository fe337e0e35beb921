/*!
 * Circuit Dataplane Library
 * Buffer transport and flow control between producer and consumer stages
 */

pub mod core;
pub mod endpoint;
pub mod mailbox;
pub mod monitoring;
pub mod smb;
pub mod transport;
pub mod xfer;

// Re-exports
pub use crate::core::{DataplaneError, DataplaneResult, TransportConfig};
pub use endpoint::{Endpoint, Protocol};
pub use monitoring::{init_tracing, DataplaneStats, StatsSnapshot};
pub use transport::{
    BufferHandle, Circuit, CircuitDescription, CircuitState, Distribution, MetaFlags,
    PortSetDescription, Transport, TransportContext, WorkerPort,
};
pub use xfer::DriverRegistry;
