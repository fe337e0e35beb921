/*!
 * Software Fabric
 * In-process verbs provider performing one-sided writes between registered regions
 *
 * Models the parts of RC semantics the transport depends on: queue pairs must
 * be RTS to send and the peer must be at least RTR, work requests execute in
 * post order, keys and bounds are validated against registrations, and the
 * first failed request moves the queue pair to the error state so later
 * requests complete as flushed.
 */

use super::verbs::{
    CompletionCode, CqHandle, DeviceContext, Gid, MemoryRegistration, PortAttributes,
    QpCapabilities, QpState, QpTransition, Qpn, SendWorkRequest, Verbs, WorkCompletion,
};
use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::types::align_up;
use crate::smb::Region;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

const VADDR_BASE: u64 = 0x7f00_0000_0000;
const VADDR_SPACING: u64 = 1 << 20;
const LINK_LOCAL_PREFIX: u64 = 0xfe80_0000_0000_0000;

/// Record of one executed work request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedWork {
    pub wr_id: u64,
    pub length: u32,
    pub fenced: bool,
    pub status: CompletionCode,
}

struct MemoryEntry {
    device: u32,
    region: Arc<Region>,
    vaddr: u64,
    length: u64,
}

struct QueuePairEntry {
    device: u32,
    cq: CqHandle,
    state: QpState,
    dest: Option<Qpn>,
    max_send_wr: u32,
}

#[derive(Default)]
struct FabricState {
    next_id: u32,
    next_vaddr: u64,
    open: HashMap<u32, String>,
    memory: HashMap<u32, MemoryEntry>,
    cqs: HashMap<CqHandle, (VecDeque<WorkCompletion>, u32)>,
    qps: HashMap<Qpn, QueuePairEntry>,
    log: HashMap<Qpn, Vec<PostedWork>>,
    cookies: HashMap<(String, String), u64>,
    /// Remaining writes to fail with a remote access error
    injected_faults: usize,
}

impl FabricState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct SoftFabric {
    devices: Vec<String>,
    state: Mutex<FabricState>,
}

impl SoftFabric {
    pub fn new<S: AsRef<str>>(devices: &[S]) -> Arc<Self> {
        Arc::new(Self {
            devices: devices.iter().map(|d| d.as_ref().to_string()).collect(),
            state: Mutex::new(FabricState {
                next_vaddr: VADDR_BASE,
                ..Default::default()
            }),
        })
    }

    fn device_index(&self, name: &str) -> Option<usize> {
        self.devices.iter().position(|d| d == name)
    }

    /// Fail the next `count` writes with `RemoteAccessError`
    pub fn inject_remote_access_errors(&self, count: usize) {
        self.state.lock().injected_faults = count;
    }

    /// Work requests executed on `qpn`, in execution order
    pub fn posted_work(&self, qpn: Qpn) -> Vec<PostedWork> {
        self.state.lock().log.get(&qpn).cloned().unwrap_or_default()
    }

    pub fn queue_pairs(&self) -> Vec<Qpn> {
        let mut qps: Vec<Qpn> = self.state.lock().qps.keys().copied().collect();
        qps.sort_unstable();
        qps
    }

    /// Resolve `[addr, addr+len)` inside the registration for `key`
    fn translate(
        state: &FabricState,
        key: u32,
        addr: u64,
        len: u32,
    ) -> Option<(Arc<Region>, u64, u32)> {
        let entry = state.memory.get(&key)?;
        let end = addr.checked_add(len as u64)?;
        if addr < entry.vaddr || end > entry.vaddr + entry.length {
            return None;
        }
        Some((entry.region.clone(), addr - entry.vaddr, entry.device))
    }

    fn execute(state: &mut FabricState, qpn: Qpn, wr: &SendWorkRequest) -> CompletionCode {
        if state.qps.get(&qpn).map(|qp| qp.state) != Some(QpState::ReadyToSend) {
            return CompletionCode::WorkRequestFlushed;
        }
        let Some((local, local_offset, local_dev)) =
            Self::translate(state, wr.lkey, wr.local_addr, wr.length)
        else {
            return CompletionCode::LocalProtectionError;
        };
        let qp_dev = state.qps.get(&qpn).map(|qp| qp.device);
        if qp_dev != Some(local_dev) {
            return CompletionCode::LocalProtectionError;
        }

        let dest_ready = state
            .qps
            .get(&qpn)
            .and_then(|qp| qp.dest)
            .and_then(|dest| state.qps.get(&dest))
            .map(|peer| matches!(peer.state, QpState::ReadyToReceive | QpState::ReadyToSend))
            .unwrap_or(false);
        if !dest_ready {
            return CompletionCode::RemoteInvalidRequest;
        }

        if state.injected_faults > 0 {
            state.injected_faults -= 1;
            return CompletionCode::RemoteAccessError;
        }
        let Some((remote, remote_offset, _)) =
            Self::translate(state, wr.rkey, wr.remote_addr, wr.length)
        else {
            return CompletionCode::RemoteAccessError;
        };

        match Region::copy_between(&local, local_offset, &remote, remote_offset, wr.length as u64) {
            Ok(()) => CompletionCode::Success,
            Err(_) => CompletionCode::RemoteAccessError,
        }
    }
}

impl Verbs for SoftFabric {
    fn device_names(&self) -> Vec<String> {
        self.devices.clone()
    }

    fn open_device(&self, name: &str) -> DataplaneResult<DeviceContext> {
        if self.device_index(name).is_none() {
            return Err(DataplaneError::DeviceNotFound {
                device: name.to_string(),
            });
        }
        let mut state = self.state.lock();
        let id = state.next_id();
        state.open.insert(id, name.to_string());
        Ok(DeviceContext {
            id,
            name: name.to_string(),
        })
    }

    fn query_port(&self, device: &DeviceContext, port: u8) -> DataplaneResult<PortAttributes> {
        let index = self
            .device_index(&device.name)
            .ok_or_else(|| DataplaneError::DeviceNotFound {
                device: device.name.clone(),
            })?;
        if port != 1 {
            return Err(DataplaneError::api("ibv_query_port", format!("no port {}", port)));
        }
        Ok(PortAttributes {
            lid: index as u16 + 1,
            active: true,
        })
    }

    fn query_gid(&self, device: &DeviceContext, port: u8, index: u8) -> DataplaneResult<Gid> {
        let dev = self
            .device_index(&device.name)
            .ok_or_else(|| DataplaneError::DeviceNotFound {
                device: device.name.clone(),
            })?;
        if port != 1 || index != 0 {
            return Err(DataplaneError::api(
                "ibv_query_gid",
                format!("no gid {} on port {}", index, port),
            ));
        }
        Ok(Gid {
            hi: LINK_LOCAL_PREFIX,
            lo: dev as u64 + 1,
        })
    }

    fn register_memory(
        &self,
        device: &DeviceContext,
        region: Arc<Region>,
    ) -> DataplaneResult<MemoryRegistration> {
        let mut state = self.state.lock();
        if !state.open.contains_key(&device.id) {
            return Err(DataplaneError::Resource {
                device: device.name.clone(),
                resource: "memory region".to_string(),
            });
        }
        let key = state.next_id();
        let length = region.size();
        let vaddr = state.next_vaddr;
        state.next_vaddr = align_up(vaddr + length, VADDR_SPACING) + VADDR_SPACING;
        state.memory.insert(
            key,
            MemoryEntry {
                device: device.id,
                region,
                vaddr,
                length,
            },
        );
        debug!(device = %device.name, key, vaddr, length, "Memory registered");
        Ok(MemoryRegistration {
            lkey: key,
            rkey: key,
            vaddr,
            length,
        })
    }

    fn deregister_memory(&self, registration: &MemoryRegistration) -> DataplaneResult<()> {
        self.state
            .lock()
            .memory
            .remove(&registration.lkey)
            .map(|_| ())
            .ok_or_else(|| DataplaneError::api("ibv_dereg_mr", "unknown registration"))
    }

    fn create_cq(&self, device: &DeviceContext, depth: u32) -> DataplaneResult<CqHandle> {
        let mut state = self.state.lock();
        if !state.open.contains_key(&device.id) || depth == 0 {
            return Err(DataplaneError::Resource {
                device: device.name.clone(),
                resource: "completion queue".to_string(),
            });
        }
        let cq = state.next_id();
        state.cqs.insert(cq, (VecDeque::new(), depth));
        Ok(cq)
    }

    fn destroy_cq(&self, cq: CqHandle) -> DataplaneResult<()> {
        self.state
            .lock()
            .cqs
            .remove(&cq)
            .map(|_| ())
            .ok_or_else(|| DataplaneError::api("ibv_destroy_cq", "unknown completion queue"))
    }

    fn create_qp(
        &self,
        device: &DeviceContext,
        cq: CqHandle,
        caps: QpCapabilities,
    ) -> DataplaneResult<Qpn> {
        let mut state = self.state.lock();
        if !state.open.contains_key(&device.id) || !state.cqs.contains_key(&cq) {
            return Err(DataplaneError::Resource {
                device: device.name.clone(),
                resource: "queue pair".to_string(),
            });
        }
        let qpn = state.next_id();
        state.qps.insert(
            qpn,
            QueuePairEntry {
                device: device.id,
                cq,
                state: QpState::Reset,
                dest: None,
                max_send_wr: caps.max_send_wr,
            },
        );
        Ok(qpn)
    }

    fn modify_qp(&self, qpn: Qpn, transition: QpTransition) -> DataplaneResult<()> {
        let mut state = self.state.lock();
        let qp = state
            .qps
            .get_mut(&qpn)
            .ok_or_else(|| DataplaneError::api("ibv_modify_qp", format!("unknown qp {}", qpn)))?;

        let next = match (qp.state, transition) {
            (QpState::Reset, QpTransition::Init { .. }) => QpState::Init,
            (QpState::Init, QpTransition::ReadyToReceive { dest_qpn, .. }) => {
                qp.dest = Some(dest_qpn);
                QpState::ReadyToReceive
            }
            (QpState::ReadyToReceive, QpTransition::ReadyToSend { .. }) => QpState::ReadyToSend,
            (from, to) => {
                return Err(DataplaneError::api(
                    "ibv_modify_qp",
                    format!("invalid transition {:?} -> {:?}", from, to),
                ));
            }
        };
        qp.state = next;
        Ok(())
    }

    fn qp_state(&self, qpn: Qpn) -> DataplaneResult<QpState> {
        self.state
            .lock()
            .qps
            .get(&qpn)
            .map(|qp| qp.state)
            .ok_or_else(|| DataplaneError::api("ibv_query_qp", format!("unknown qp {}", qpn)))
    }

    fn destroy_qp(&self, qpn: Qpn) -> DataplaneResult<()> {
        let mut state = self.state.lock();
        state.log.remove(&qpn);
        state
            .qps
            .remove(&qpn)
            .map(|_| ())
            .ok_or_else(|| DataplaneError::api("ibv_destroy_qp", format!("unknown qp {}", qpn)))
    }

    fn post_send(&self, qpn: Qpn, chain: &[SendWorkRequest]) -> DataplaneResult<()> {
        let mut state = self.state.lock();
        let (cq, qp_state, max_send_wr) = state
            .qps
            .get(&qpn)
            .map(|qp| (qp.cq, qp.state, qp.max_send_wr))
            .ok_or_else(|| DataplaneError::api("ibv_post_send", format!("unknown qp {}", qpn)))?;
        if qp_state != QpState::ReadyToSend && qp_state != QpState::Error {
            return Err(DataplaneError::api(
                "ibv_post_send",
                format!("qp {} is {:?}", qpn, qp_state),
            ));
        }
        if chain.len() > max_send_wr as usize {
            return Err(DataplaneError::api("ibv_post_send", "chain exceeds send queue depth"));
        }

        for wr in chain {
            // Execution is in post order, so a fence is satisfied on arrival
            let status = Self::execute(&mut state, qpn, wr);
            if status != CompletionCode::Success {
                if let Some(qp) = state.qps.get_mut(&qpn) {
                    qp.state = QpState::Error;
                }
            }
            state.log.entry(qpn).or_default().push(PostedWork {
                wr_id: wr.wr_id,
                length: wr.length,
                fenced: wr.fenced,
                status,
            });
            if wr.signaled || status != CompletionCode::Success {
                if let Some((queue, depth)) = state.cqs.get_mut(&cq) {
                    if queue.len() >= *depth as usize {
                        return Err(DataplaneError::api("ibv_post_send", "completion queue overrun"));
                    }
                    queue.push_back(WorkCompletion {
                        wr_id: wr.wr_id,
                        status,
                        byte_len: wr.length,
                    });
                }
            }
        }
        Ok(())
    }

    fn poll_cq(&self, cq: CqHandle, max: usize) -> DataplaneResult<Vec<WorkCompletion>> {
        let mut state = self.state.lock();
        let (queue, _) = state
            .cqs
            .get_mut(&cq)
            .ok_or_else(|| DataplaneError::api("ibv_poll_cq", "unknown completion queue"))?;
        let take = max.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    fn publish_cookie(&self, from: &str, to: &str, cookie: u64) {
        self.state
            .lock()
            .cookies
            .insert((from.to_string(), to.to_string()), cookie);
    }

    fn lookup_cookie(&self, from: &str, to: &str) -> Option<u64> {
        self.state
            .lock()
            .cookies
            .get(&(from.to_string(), to.to_string()))
            .copied()
    }

    fn handshakes_for(&self, to: &str) -> Vec<String> {
        self.state
            .lock()
            .cookies
            .keys()
            .filter(|(_, target)| target == to)
            .map(|(from, _)| from.clone())
            .collect()
    }
}
