/*!
 * Verbs Capability
 * The subset of the RDMA verbs interface the OFED backend relies on
 *
 * Hardware access sits behind this trait so that the backend's queue-pair
 * state machine, work-request chaining and completion routing are the same
 * whether the provider is a NIC or the in-process [`SoftFabric`](super::SoftFabric).
 */

use crate::core::errors::DataplaneResult;
use crate::smb::Region;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Queue pair number
pub type Qpn = u32;

/// Completion queue handle
pub type CqHandle = u32;

/// Opened device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceContext {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttributes {
    pub lid: u16,
    pub active: bool,
}

/// 128-bit global identifier split into halves as carried by endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gid {
    pub hi: u64,
    pub lo: u64,
}

/// Registered memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegistration {
    pub lkey: u32,
    pub rkey: u32,
    pub vaddr: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCapabilities {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

/// Parameters of the RESET->INIT->RTR->RTS transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpTransition {
    Init {
        port: u8,
    },
    ReadyToReceive {
        dest_qpn: Qpn,
        rq_psn: u32,
        dlid: u16,
        dgid: Gid,
        port: u8,
        hop_limit: u8,
        sgid_index: u8,
        min_rnr_timer: u8,
    },
    ReadyToSend {
        sq_psn: u32,
        timeout: u8,
        retry_count: u8,
        rnr_retry: u8,
    },
}

/// One-sided RDMA write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWorkRequest {
    pub wr_id: u64,
    pub local_addr: u64,
    pub length: u32,
    pub lkey: u32,
    pub remote_addr: u64,
    pub rkey: u32,
    /// Wait for every earlier request on the queue pair before executing
    pub fenced: bool,
    pub signaled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionCode {
    Success,
    LocalProtectionError,
    RemoteAccessError,
    RemoteInvalidRequest,
    WorkRequestFlushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: CompletionCode,
    pub byte_len: u32,
}

pub trait Verbs: Send + Sync {
    fn device_names(&self) -> Vec<String>;

    fn open_device(&self, name: &str) -> DataplaneResult<DeviceContext>;

    fn query_port(&self, device: &DeviceContext, port: u8) -> DataplaneResult<PortAttributes>;

    fn query_gid(&self, device: &DeviceContext, port: u8, index: u8) -> DataplaneResult<Gid>;

    fn register_memory(
        &self,
        device: &DeviceContext,
        region: Arc<Region>,
    ) -> DataplaneResult<MemoryRegistration>;

    fn deregister_memory(&self, registration: &MemoryRegistration) -> DataplaneResult<()>;

    fn create_cq(&self, device: &DeviceContext, depth: u32) -> DataplaneResult<CqHandle>;

    fn destroy_cq(&self, cq: CqHandle) -> DataplaneResult<()>;

    fn create_qp(
        &self,
        device: &DeviceContext,
        cq: CqHandle,
        caps: QpCapabilities,
    ) -> DataplaneResult<Qpn>;

    fn modify_qp(&self, qpn: Qpn, transition: QpTransition) -> DataplaneResult<()>;

    fn qp_state(&self, qpn: Qpn) -> DataplaneResult<QpState>;

    fn destroy_qp(&self, qpn: Qpn) -> DataplaneResult<()>;

    /// Post a chain of work requests; they execute in order
    fn post_send(&self, qpn: Qpn, chain: &[SendWorkRequest]) -> DataplaneResult<()>;

    fn poll_cq(&self, cq: CqHandle, max: usize) -> DataplaneResult<Vec<WorkCompletion>>;

    // Connection manager: out-of-band exchange of queue pair numbers

    /// Advertise `cookie` for the connection `from` -> `to`
    fn publish_cookie(&self, from: &str, to: &str, cookie: u64);

    /// Cookie advertised by `from` for its connection to `to`
    fn lookup_cookie(&self, from: &str, to: &str) -> Option<u64>;

    /// Endpoints that advertised a connection towards `to`
    fn handshakes_for(&self, to: &str) -> Vec<String>;
}
