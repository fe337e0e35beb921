/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 */

use super::types::{CircuitId, Offset, PortOrdinal};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dataplane errors with structured context
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum DataplaneError {
    #[error("Unsupported endpoint '{endpoint}': {reason}")]
    #[diagnostic(
        code(endpoint::unsupported),
        help("Check the protocol prefix and the number of ':' and '.' separated fields.")
    )]
    UnsupportedEndpoint { endpoint: String, reason: String },

    #[error("Unknown endpoint '{endpoint}'")]
    #[diagnostic(
        code(endpoint::unknown),
        help("The endpoint has not been created locally or published by its owner.")
    )]
    UnknownEndpoint { endpoint: String },

    #[error("Endpoint '{endpoint}' is finalized and can no longer be modified")]
    #[diagnostic(code(endpoint::finalized))]
    EndpointFinalized { endpoint: String },

    #[error("Endpoint '{endpoint}' has not been finalized")]
    #[diagnostic(
        code(endpoint::not_finalized),
        help("Create the local resources for the endpoint before comparing or connecting it.")
    )]
    EndpointNotFinalized { endpoint: String },

    #[error("No more shared memory on '{endpoint}': requested {requested} bytes (alignment {alignment})")]
    #[diagnostic(
        code(smb::exhausted),
        help("Increase the SMB size or release circuits that are no longer used.")
    )]
    NoMoreSharedMemory {
        endpoint: String,
        requested: u64,
        alignment: u64,
    },

    #[error("No buffer memory available on '{endpoint}' for circuit {circuit} port {port}")]
    #[diagnostic(
        code(smb::no_buffers),
        help("Partial allocations were rolled back. Retry once memory has been released.")
    )]
    NoMoreBufferAvailable {
        endpoint: String,
        circuit: CircuitId,
        port: PortOrdinal,
    },

    #[error("Access out of bounds: offset {offset}, length {len}, region size {region_size}")]
    #[diagnostic(code(smb::out_of_bounds))]
    OutOfBounds {
        offset: Offset,
        len: u64,
        region_size: u64,
    },

    #[error("RDMA device '{device}' not found")]
    #[diagnostic(
        code(ofed::device_not_found),
        help("List the available devices and set the configured device name accordingly.")
    )]
    DeviceNotFound { device: String },

    #[error("Could not open RDMA device '{device}': {reason}")]
    #[diagnostic(code(ofed::open_failed))]
    CouldNotOpenDevice { device: String, reason: String },

    #[error("Could not create {resource} on device '{device}'")]
    #[diagnostic(
        code(ofed::resource),
        help("Queue pair, completion queue and memory registration limits may be exhausted.")
    )]
    Resource { device: String, resource: String },

    #[error("Transport API call '{call}' failed: {detail}")]
    #[diagnostic(code(xfer::api))]
    Api { call: String, detail: String },

    #[error("Socket for '{endpoint}' closed")]
    #[diagnostic(code(xfer::socket_closed))]
    SocketClosed { endpoint: String },

    #[error("Transfer failed on circuit {circuit}: {detail}")]
    #[diagnostic(
        code(transport::transfer_failed),
        help("The circuit has been quiesced. Release it and rebuild the connection.")
    )]
    TransferFailed { circuit: CircuitId, detail: String },

    #[error("Circuit {circuit} not found")]
    #[diagnostic(code(transport::circuit_not_found))]
    CircuitNotFound { circuit: CircuitId },

    #[error("Port {port} not found in circuit {circuit}")]
    #[diagnostic(code(transport::port_not_found))]
    PortNotFound {
        circuit: CircuitId,
        port: PortOrdinal,
    },

    #[error("Invalid state: {detail}")]
    #[diagnostic(code(dataplane::invalid_state))]
    InvalidState { detail: String },

    #[error("Invalid configuration: {detail}")]
    #[diagnostic(code(dataplane::config))]
    Config { detail: String },
}

impl DataplaneError {
    pub fn unsupported(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        DataplaneError::UnsupportedEndpoint {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    pub fn api(call: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        DataplaneError::Api {
            call: call.into(),
            detail: detail.to_string(),
        }
    }

    pub fn invalid_state(detail: impl Into<String>) -> Self {
        DataplaneError::InvalidState {
            detail: detail.into(),
        }
    }

    /// Exhaustion errors can be retried once resources are released
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            DataplaneError::NoMoreSharedMemory { .. } | DataplaneError::NoMoreBufferAvailable { .. }
        )
    }
}

impl From<std::io::Error> for DataplaneError {
    fn from(err: std::io::Error) -> Self {
        DataplaneError::Api {
            call: "io".to_string(),
            detail: err.to_string(),
        }
    }
}

/// Result type for dataplane operations
pub type DataplaneResult<T> = Result<T, DataplaneError>;
