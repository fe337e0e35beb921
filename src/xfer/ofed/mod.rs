/*!
 * OFED Driver
 * RDMA reliable-connection backend over a [`Verbs`] provider
 *
 * Each local SMB registers its memory and owns one completion queue shared
 * by every outgoing connection. A connection is an RC queue pair created in
 * INIT and moved through RTR to RTS once the peer's queue pair number (the
 * connection cookie) is known. Within a request, payload copies are posted
 * first and the flag copy last with a fence, so the remote flag can never be
 * observed before the payload it guards.
 */

mod soft;
mod verbs;

pub use soft::{PostedWork, SoftFabric};
pub use verbs::{
    CompletionCode, CqHandle, DeviceContext, Gid, MemoryRegistration, PortAttributes,
    QpCapabilities, QpState, QpTransition, Qpn, SendWorkRequest, Verbs, WorkCompletion,
};

use super::traits::{TransferDriver, XferRequest, XferServices};
use super::types::{CompletionStatus, XferFlags};
use super::SmemBackend;
use crate::core::config::{OfedConfig, TransportConfig};
use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::types::{MailboxId, Offset};
use crate::endpoint::{Endpoint, EndpointAddress, OfedAddress, Protocol};
use crate::smb::{Region, SmemServices};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Completions polled per `status()` call
const WC_COUNT: usize = 1;

/// Progress of one posted request, updated by whoever polls the shared queue
#[derive(Debug, Default)]
struct RequestProgress {
    posted: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicBool,
}

/// Routes completions from an SMB's completion queue to their requests
///
/// Every connection out of one SMB shares the queue, so a poll on behalf of
/// one request may retire work of another.
struct CompletionRouter {
    verbs: Arc<dyn Verbs>,
    cq: CqHandle,
    next_wr_id: AtomicU64,
    inflight: Mutex<HashMap<u64, Arc<RequestProgress>>>,
    /// Serializes polling of the completion queue
    poll_lock: Mutex<()>,
}

impl CompletionRouter {
    fn register(&self) -> (u64, Arc<RequestProgress>) {
        let id = self.next_wr_id.fetch_add(1, Ordering::Relaxed) + 1;
        let progress = Arc::new(RequestProgress::default());
        self.inflight.lock().insert(id, progress.clone());
        (id, progress)
    }

    fn unregister(&self, id: u64) {
        self.inflight.lock().remove(&id);
    }

    /// Poll once; returns the number of completions retired
    fn poll(&self, max: usize) -> DataplaneResult<usize> {
        let _serial = self.poll_lock.lock();
        let completions = self.verbs.poll_cq(self.cq, max)?;
        let inflight = self.inflight.lock();
        for wc in &completions {
            match inflight.get(&wc.wr_id) {
                Some(progress) => {
                    if wc.status != CompletionCode::Success {
                        warn!(wr_id = wc.wr_id, status = ?wc.status, "RDMA work request failed");
                        progress.failed.store(true, Ordering::SeqCst);
                    }
                    progress.completed.fetch_add(1, Ordering::SeqCst);
                }
                None => debug!(wr_id = wc.wr_id, "Completion for a retired request"),
            }
        }
        Ok(completions.len())
    }
}

/// Registered memory and completion queue of a local SMB
pub struct OfedSmem {
    verbs: Arc<dyn Verbs>,
    device: DeviceContext,
    mr: MemoryRegistration,
    router: Arc<CompletionRouter>,
}

impl OfedSmem {
    pub fn registration(&self) -> &MemoryRegistration {
        &self.mr
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }
}

impl Drop for OfedSmem {
    fn drop(&mut self) {
        if let Err(e) = self.verbs.deregister_memory(&self.mr) {
            error!("Deregistering memory on {} failed: {}", self.device.name, e);
        }
        if let Err(e) = self.verbs.destroy_cq(self.router.cq) {
            error!("Destroying completion queue on {} failed: {}", self.device.name, e);
        }
    }
}

pub struct OfedDriver {
    verbs: Arc<dyn Verbs>,
    config: OfedConfig,
    /// Opened devices, shared by every SMB of this driver
    devices: Mutex<HashMap<String, DeviceContext>>,
}

impl OfedDriver {
    pub fn new(verbs: Arc<dyn Verbs>, config: OfedConfig) -> Self {
        Self {
            verbs,
            config,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Configured device, or the first one the provider lists
    fn default_device(&self) -> DataplaneResult<String> {
        if let Some(name) = &self.config.device {
            return Ok(name.clone());
        }
        self.verbs
            .device_names()
            .into_iter()
            .next()
            .ok_or_else(|| DataplaneError::DeviceNotFound {
                device: "<any>".to_string(),
            })
    }

    fn open(&self, name: &str) -> DataplaneResult<DeviceContext> {
        let mut devices = self.devices.lock();
        if let Some(device) = devices.get(name) {
            return Ok(device.clone());
        }
        if !self.verbs.device_names().iter().any(|d| d == name) {
            return Err(DataplaneError::DeviceNotFound {
                device: name.to_string(),
            });
        }
        let device = self.verbs.open_device(name).map_err(|e| match e {
            DataplaneError::DeviceNotFound { .. } => e,
            other => DataplaneError::CouldNotOpenDevice {
                device: name.to_string(),
                reason: other.to_string(),
            },
        })?;
        info!(device = %name, "RDMA device opened");
        devices.insert(name.to_string(), device.clone());
        Ok(device)
    }

    fn address_of(endpoint: &Endpoint) -> DataplaneResult<&OfedAddress> {
        match endpoint.address() {
            EndpointAddress::Ofed(addr) => Ok(addr),
            _ => Err(DataplaneError::unsupported(endpoint.to_string(), "not an RDMA endpoint")),
        }
    }

    fn resource(device: &DeviceContext, resource: &str) -> impl FnOnce(DataplaneError) -> DataplaneError {
        let device = device.name.clone();
        let resource = resource.to_string();
        move |e| {
            warn!("Creating {} on {} failed: {}", resource, device, e);
            DataplaneError::Resource { device, resource }
        }
    }
}

impl TransferDriver for OfedDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Ofed
    }

    fn allocate_endpoint(
        &self,
        config: &TransportConfig,
        mailbox: MailboxId,
        max_mailboxes: u16,
    ) -> DataplaneResult<Endpoint> {
        let device = self.default_device()?;
        Endpoint::new(
            EndpointAddress::Ofed(OfedAddress::unassigned(device, self.config.port)),
            config.smb_size,
            mailbox,
            max_mailboxes,
        )
    }

    fn connect(
        &self,
        endpoint: &Endpoint,
        local: bool,
        _config: &TransportConfig,
    ) -> DataplaneResult<Arc<SmemServices>> {
        let addr = Self::address_of(endpoint)?.clone();
        let mut endpoint = endpoint.clone();

        if !local {
            endpoint.finalize();
            return Ok(Arc::new(SmemServices::new(endpoint, None, false, SmemBackend::Remote)?));
        }

        let device = self.open(&addr.device)?;
        let port = self.verbs.query_port(&device, addr.port)?;
        if !port.active {
            return Err(DataplaneError::api(
                "ibv_query_port",
                format!("port {} of {} is down", addr.port, device.name),
            ));
        }
        let gid = self.verbs.query_gid(&device, addr.port, self.config.gid_index)?;

        let region = Arc::new(Region::new(endpoint.size()));
        let mr = self
            .verbs
            .register_memory(&device, region.clone())
            .map_err(Self::resource(&device, "memory region"))?;
        let cq = match self.verbs.create_cq(&device, self.config.max_cq_depth) {
            Ok(cq) => cq,
            Err(e) => {
                let _ = self.verbs.deregister_memory(&mr);
                return Err(Self::resource(&device, "completion queue")(e));
            }
        };

        // Initial packet sequence number follows the mailbox id
        let psn = endpoint.mailbox() as u32;
        endpoint.set_ofed_hardware(port.lid, (gid.hi, gid.lo), psn, mr.rkey, mr.vaddr)?;
        endpoint.finalize();

        info!(
            endpoint = %endpoint,
            device = %device.name,
            lid = port.lid,
            rkey = mr.rkey,
            "RDMA SMB registered"
        );

        let router = Arc::new(CompletionRouter {
            verbs: self.verbs.clone(),
            cq,
            next_wr_id: AtomicU64::new(0),
            inflight: Mutex::new(HashMap::new()),
            poll_lock: Mutex::new(()),
        });
        let smem = OfedSmem {
            verbs: self.verbs.clone(),
            device,
            mr,
            router,
        };
        Ok(Arc::new(SmemServices::new(
            endpoint,
            Some(region),
            true,
            SmemBackend::Ofed(smem),
        )?))
    }

    fn create_connection(
        &self,
        source: &Arc<SmemServices>,
        target: &Arc<SmemServices>,
    ) -> DataplaneResult<Arc<dyn XferServices>> {
        let SmemBackend::Ofed(local) = source.backend() else {
            return Err(DataplaneError::invalid_state(format!(
                "RDMA connection source {} is not a local RDMA SMB",
                source.key()
            )));
        };
        let remote = Self::address_of(target.endpoint())?.clone();

        let qpn = self
            .verbs
            .create_qp(
                &local.device,
                local.router.cq,
                QpCapabilities {
                    max_send_wr: self.config.max_tx_depth,
                    max_recv_wr: 1,
                    max_send_sge: 1,
                    max_recv_sge: 1,
                },
            )
            .map_err(Self::resource(&local.device, "queue pair"))?;
        self.verbs
            .modify_qp(qpn, QpTransition::Init { port: self.config.port })?;

        debug!(source = %source.key(), target = %target.key(), qpn, "RDMA queue pair in INIT");

        Ok(Arc::new(OfedXferServices {
            inner: Arc::new(OfedConnection {
                verbs: self.verbs.clone(),
                config: self.config.clone(),
                source: source.clone(),
                target: target.clone(),
                remote,
                lkey: local.mr.lkey,
                local_vaddr: local.mr.vaddr,
                router: local.router.clone(),
                qpn,
                finalized: AtomicBool::new(false),
                finalize_lock: Mutex::new(()),
            }),
        }))
    }

    fn pending_handshakes(&self, local: &SmemServices) -> Vec<String> {
        self.verbs.handshakes_for(local.key())
    }
}

struct OfedConnection {
    verbs: Arc<dyn Verbs>,
    config: OfedConfig,
    source: Arc<SmemServices>,
    target: Arc<SmemServices>,
    remote: OfedAddress,
    lkey: u32,
    local_vaddr: u64,
    router: Arc<CompletionRouter>,
    qpn: Qpn,
    finalized: AtomicBool,
    finalize_lock: Mutex<()>,
}

/// Connection to one target SMB over an RC queue pair
pub struct OfedXferServices {
    inner: Arc<OfedConnection>,
}

impl OfedXferServices {
    pub fn qpn(&self) -> Qpn {
        self.inner.qpn
    }
}

impl XferServices for OfedXferServices {
    fn source(&self) -> &Arc<SmemServices> {
        &self.inner.source
    }

    fn target(&self) -> &Arc<SmemServices> {
        &self.inner.target
    }

    fn create_request(&self) -> DataplaneResult<Box<dyn XferRequest>> {
        if !self.is_finalized() {
            return Err(DataplaneError::invalid_state(format!(
                "RDMA connection {} -> {} used before finalize",
                self.inner.source.key(),
                self.inner.target.key()
            )));
        }
        let (wr_id, progress) = self.inner.router.register();
        Ok(Box::new(OfedXferRequest {
            conn: self.inner.clone(),
            wr_id,
            progress,
            first: Vec::new(),
            middle: Vec::new(),
            last: Vec::new(),
            posted: false,
        }))
    }

    fn connection_cookie(&self) -> u64 {
        self.inner.qpn as u64
    }

    fn finalize(&self, cookie: u64) -> DataplaneResult<()> {
        let conn = &self.inner;
        let _guard = conn.finalize_lock.lock();
        if conn.finalized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let dest_qpn = Qpn::try_from(cookie)
            .map_err(|_| DataplaneError::api("finalize", format!("cookie {} is not a qpn", cookie)))?;

        conn.verbs.modify_qp(
            conn.qpn,
            QpTransition::ReadyToReceive {
                dest_qpn,
                rq_psn: conn.remote.psn,
                dlid: conn.remote.lid,
                dgid: Gid {
                    hi: conn.remote.gid_hi,
                    lo: conn.remote.gid_lo,
                },
                port: conn.config.port,
                hop_limit: conn.config.hop_limit,
                sgid_index: conn.config.gid_index,
                min_rnr_timer: conn.config.rnr_timer,
            },
        )?;
        let sq_psn = match conn.source.endpoint().address() {
            EndpointAddress::Ofed(addr) => addr.psn,
            _ => 0,
        };
        conn.verbs.modify_qp(
            conn.qpn,
            QpTransition::ReadyToSend {
                sq_psn,
                timeout: conn.config.qp_timeout,
                retry_count: conn.config.retry_count,
                rnr_retry: conn.config.rnr_retry,
            },
        )?;
        conn.finalized.store(true, Ordering::SeqCst);

        info!(
            source = %conn.source.key(),
            target = %conn.target.key(),
            qpn = conn.qpn,
            dest_qpn,
            "RDMA connection ready"
        );
        Ok(())
    }

    fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::SeqCst)
    }

    fn poll_handshake(&self) -> DataplaneResult<bool> {
        if self.is_finalized() {
            return Ok(true);
        }
        let conn = &self.inner;
        conn.verbs
            .publish_cookie(conn.source.key(), conn.target.key(), self.connection_cookie());
        match conn.verbs.lookup_cookie(conn.target.key(), conn.source.key()) {
            Some(peer) => {
                self.finalize(peer)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for OfedConnection {
    fn drop(&mut self) {
        if let Err(e) = self.verbs.destroy_qp(self.qpn) {
            error!("Destroying queue pair {} failed: {}", self.qpn, e);
        }
    }
}

/// Work requests of one request, chained by role
struct OfedXferRequest {
    conn: Arc<OfedConnection>,
    wr_id: u64,
    progress: Arc<RequestProgress>,
    first: Vec<SendWorkRequest>,
    middle: Vec<SendWorkRequest>,
    last: Vec<SendWorkRequest>,
    posted: bool,
}

impl OfedXferRequest {
    fn work_request(&self, src: Offset, dst: Offset, len: u64) -> DataplaneResult<SendWorkRequest> {
        let length = u32::try_from(len)
            .map_err(|_| DataplaneError::api("ibv_post_send", format!("{} bytes exceeds a work request", len)))?;
        Ok(SendWorkRequest {
            wr_id: self.wr_id,
            local_addr: self.conn.local_vaddr + src,
            length,
            lkey: self.conn.lkey,
            remote_addr: self.conn.remote.vaddr + dst,
            rkey: self.conn.remote.rkey,
            fenced: false,
            signaled: true,
        })
    }

    fn chain_len(&self) -> usize {
        self.first.len() + self.middle.len() + self.last.len()
    }
}

impl XferRequest for OfedXferRequest {
    fn copy(&mut self, src: Offset, dst: Offset, len: u64, flags: XferFlags) -> DataplaneResult<()> {
        if self.posted {
            return Err(DataplaneError::invalid_state("copy after post"));
        }
        let mut wr = self.work_request(src, dst, len)?;
        if flags.contains(XferFlags::FLAG_TRANSFER) {
            // Only the first flagged write carries the fence; later ones
            // already follow it on the same queue pair
            wr.fenced = self.last.is_empty();
            self.last.push(wr);
        } else if flags.contains(XferFlags::DATA_TRANSFER) {
            self.first.push(wr);
        } else {
            self.middle.push(wr);
        }
        Ok(())
    }

    fn post(&mut self) -> DataplaneResult<()> {
        if self.posted {
            return Err(DataplaneError::invalid_state("request posted twice"));
        }
        self.progress
            .posted
            .store(self.chain_len(), Ordering::SeqCst);
        for chain in [&self.first, &self.middle, &self.last] {
            if !chain.is_empty() {
                self.conn.verbs.post_send(self.conn.qpn, chain)?;
            }
        }
        self.posted = true;
        Ok(())
    }

    fn status(&mut self) -> DataplaneResult<CompletionStatus> {
        if !self.posted {
            return Ok(CompletionStatus::Pending);
        }
        let resolve = |progress: &RequestProgress| {
            if progress.failed.load(Ordering::SeqCst) {
                Some(CompletionStatus::CompleteFailure)
            } else if progress.completed.load(Ordering::SeqCst)
                >= progress.posted.load(Ordering::SeqCst)
            {
                Some(CompletionStatus::CompleteSuccess)
            } else {
                None
            }
        };
        if let Some(done) = resolve(&self.progress) {
            return Ok(done);
        }

        if self.conn.router.poll(WC_COUNT)? == 0 {
            std::thread::yield_now();
            self.conn.router.poll(WC_COUNT)?;
        }
        Ok(resolve(&self.progress).unwrap_or(CompletionStatus::Pending))
    }

    fn copy_count(&self) -> usize {
        self.chain_len()
    }
}

impl Drop for OfedXferRequest {
    fn drop(&mut self) {
        self.conn.router.unregister(self.wr_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pair() -> (Arc<SoftFabric>, Arc<dyn XferServices>, Arc<dyn XferServices>) {
        let fabric = SoftFabric::new(&["soft0"]);
        let driver = OfedDriver::new(fabric.clone(), OfedConfig::default());
        let config = TransportConfig::default().with_smb_size(64 * 1024);

        let mut smbs = Vec::new();
        for mailbox in 0..2 {
            let endpoint = driver.allocate_endpoint(&config, mailbox, 2).unwrap();
            smbs.push(driver.connect(&endpoint, true, &config).unwrap());
        }
        let ab = driver.create_connection(&smbs[0], &smbs[1]).unwrap();
        let ba = driver.create_connection(&smbs[1], &smbs[0]).unwrap();

        assert!(!ab.poll_handshake().unwrap());
        assert!(ba.poll_handshake().unwrap());
        assert!(ab.poll_handshake().unwrap());
        (fabric, ab, ba)
    }

    #[test]
    fn test_request_before_finalize_is_rejected() {
        let fabric = SoftFabric::new(&["soft0"]);
        let driver = OfedDriver::new(fabric, OfedConfig::default());
        let config = TransportConfig::default().with_smb_size(64 * 1024);
        let a = driver
            .connect(&driver.allocate_endpoint(&config, 0, 2).unwrap(), true, &config)
            .unwrap();
        let b = driver
            .connect(&driver.allocate_endpoint(&config, 1, 2).unwrap(), true, &config)
            .unwrap();
        let services = driver.create_connection(&a, &b).unwrap();
        assert!(matches!(
            services.create_request(),
            Err(DataplaneError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_flag_copy_is_fenced_and_last() {
        let (fabric, ab, _ba) = pair();
        ab.source().region().unwrap().write_u64(4096, 0xfeed).unwrap();

        let mut request = ab.create_request().unwrap();
        request.copy(4096, 8192, 8, XferFlags::empty()).unwrap();
        request
            .copy(256, 512, 16, XferFlags::FLAG_TRANSFER | XferFlags::LAST_TRANSFER)
            .unwrap();
        request.copy(4096, 4096, 64, XferFlags::DATA_TRANSFER).unwrap();
        request.post().unwrap();

        let work = fabric.posted_work(ab.connection_cookie() as Qpn);
        let shape: Vec<(u32, bool)> = work.iter().map(|w| (w.length, w.fenced)).collect();
        assert_eq!(shape, vec![(64, false), (8, false), (16, true)]);
        assert_eq!(ab.target().region().unwrap().read_u64(8192).unwrap(), 0xfeed);

        // One completion per poll
        assert_eq!(request.status().unwrap(), CompletionStatus::Pending);
        assert_eq!(request.status().unwrap(), CompletionStatus::Pending);
        assert_eq!(request.status().unwrap(), CompletionStatus::CompleteSuccess);
        assert_eq!(request.status().unwrap(), CompletionStatus::CompleteSuccess);
    }

    #[test]
    fn test_remote_access_error_fails_request() {
        let (fabric, ab, _ba) = pair();
        fabric.inject_remote_access_errors(1);

        let mut request = ab.create_request().unwrap();
        request.copy(0, 0, 32, XferFlags::DATA_TRANSFER).unwrap();
        request
            .copy(64, 64, 16, XferFlags::FLAG_TRANSFER | XferFlags::LAST_TRANSFER)
            .unwrap();
        request.post().unwrap();

        assert_eq!(request.status().unwrap(), CompletionStatus::CompleteFailure);
        assert!(request.copy(0, 0, 8, XferFlags::empty()).is_err());
    }
}
