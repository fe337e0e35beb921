/*!
 * Socket Driver
 * One-sided copies framed over TCP
 *
 * Every local SMB runs a listener thread; each accepted peer gets a handler
 * thread that applies incoming frames to the SMB. A connection sends one frame
 * per copy, in posting order, so a flag frame is always applied after the
 * payload frames before it.
 */

use super::traits::{TransferDriver, XferRequest, XferServices};
use super::types::{posting_order, CompletionStatus, CopyOp, XferFlags};
use super::SmemBackend;
use crate::core::config::{SocketConfig, TransportConfig};
use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::limits::SOCKET_FRAME_HEADER_LEN;
use crate::core::types::{MailboxId, Offset};
use crate::endpoint::{Endpoint, EndpointAddress, Protocol, SocketAddress};
use crate::smb::{Region, SmemServices};
use crossbeam_queue::SegQueue;
use log::{error, trace, warn};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::info;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Header preceding every payload on the wire
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct FrameHeader {
    offset: u64,
    length: u32,
    /// Position of the copy inside its request
    count: u32,
}

const _: () = assert!(std::mem::size_of::<FrameHeader>() == SOCKET_FRAME_HEADER_LEN);

/// Listener thread plus the handler threads it spawned
pub struct SocketServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    handlers: Arc<SegQueue<JoinHandle<()>>>,
    peers: PeerStreams,
}

/// Clones of live peer streams, kept so `close` can interrupt their readers
type PeerStreams = Arc<Mutex<Vec<(SocketAddr, TcpStream)>>>;

impl SocketServer {
    fn start(
        listener: TcpListener,
        region: Arc<Region>,
        accept_poll: Duration,
        endpoint: String,
    ) -> DataplaneResult<Self> {
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let stop = Arc::new(AtomicBool::new(false));
        let handlers = Arc::new(SegQueue::new());
        let peers = Arc::new(Mutex::new(Vec::new()));

        let thread = {
            let stop = stop.clone();
            let handlers = handlers.clone();
            let peers = peers.clone();
            std::thread::Builder::new()
                .name(format!("smb-listener-{}", local_addr.port()))
                .spawn(move || {
                    accept_loop(listener, region, accept_poll, stop, handlers, peers, endpoint)
                })?
        };

        Ok(Self {
            local_addr,
            stop,
            listener: Mutex::new(Some(thread)),
            handlers,
            peers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peers whose handler is still running
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Stop accepting, disconnect every peer and join all threads
    ///
    /// The only call that interrupts the blocking reads of handler threads.
    pub fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.listener.lock().take() {
            if thread.join().is_err() {
                error!("Socket listener on {} panicked", self.local_addr);
            }
        }
        for (_, peer) in self.peers.lock().drain(..) {
            let _ = peer.shutdown(Shutdown::Both);
        }
        while let Some(handler) = self.handlers.pop() {
            if handler.join().is_err() {
                error!("Socket handler on {} panicked", self.local_addr);
            }
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(
    listener: TcpListener,
    region: Arc<Region>,
    accept_poll: Duration,
    stop: Arc<AtomicBool>,
    handlers: Arc<SegQueue<JoinHandle<()>>>,
    peers: PeerStreams,
    endpoint: String,
) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                reap_handlers(&handlers);
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("Dropping peer {} of {}: {}", peer, endpoint, e);
                    continue;
                }
                match stream.try_clone() {
                    Ok(clone) => peers.lock().push((peer, clone)),
                    Err(e) => {
                        warn!("Dropping peer {} of {}: {}", peer, endpoint, e);
                        continue;
                    }
                }
                let region = region.clone();
                let endpoint = endpoint.clone();
                let live = peers.clone();
                match std::thread::Builder::new()
                    .name(format!("smb-handler-{}", peer))
                    .spawn(move || {
                        handle_peer(stream, region, &endpoint);
                        live.lock().retain(|(addr, _)| *addr != peer);
                    })
                {
                    Ok(handle) => handlers.push(handle),
                    Err(e) => {
                        peers.lock().retain(|(addr, _)| *addr != peer);
                        error!("Could not spawn handler for {}: {}", peer, e);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(accept_poll),
            Err(e) => {
                warn!("Accept on {} failed: {}", endpoint, e);
                std::thread::sleep(accept_poll);
            }
        }
    }
    trace!("Listener for {} stopped", endpoint);
}

/// Join handler threads that already exited
fn reap_handlers(handlers: &SegQueue<JoinHandle<()>>) {
    for _ in 0..handlers.len() {
        let Some(handler) = handlers.pop() else {
            break;
        };
        if !handler.is_finished() {
            handlers.push(handler);
        } else if handler.join().is_err() {
            error!("Socket handler panicked");
        }
    }
}

fn handle_peer(mut stream: TcpStream, region: Arc<Region>, endpoint: &str) {
    let mut header_bytes = [0u8; SOCKET_FRAME_HEADER_LEN];
    let mut payload = Vec::new();
    loop {
        if stream.read_exact(&mut header_bytes).is_err() {
            // Peer closed or the server shut the socket down
            break;
        }
        let Some(header) = FrameHeader::read_from(&header_bytes[..]) else {
            break;
        };
        payload.resize(header.length as usize, 0);
        if let Err(e) = stream.read_exact(&mut payload) {
            warn!("Truncated frame for {}: {}", endpoint, e);
            break;
        }
        if let Err(e) = region.write_bytes(header.offset, &payload) {
            error!("Rejected frame for {} (copy {}): {}", endpoint, header.count, e);
            break;
        }
    }
    trace!("Peer handler for {} exiting", endpoint);
}

pub struct SocketDriver {
    config: SocketConfig,
}

impl SocketDriver {
    pub fn new(config: SocketConfig) -> Self {
        Self { config }
    }

    fn address_of(endpoint: &Endpoint) -> DataplaneResult<&SocketAddress> {
        match endpoint.address() {
            EndpointAddress::Socket(addr) => Ok(addr),
            _ => Err(DataplaneError::unsupported(endpoint.to_string(), "not a socket endpoint")),
        }
    }
}

impl TransferDriver for SocketDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Socket
    }

    fn allocate_endpoint(
        &self,
        config: &TransportConfig,
        mailbox: MailboxId,
        max_mailboxes: u16,
    ) -> DataplaneResult<Endpoint> {
        Endpoint::new(
            EndpointAddress::Socket(SocketAddress {
                host: self.config.ip_address.clone(),
                port: self.config.port,
            }),
            config.smb_size,
            mailbox,
            max_mailboxes,
        )
    }

    fn connect(
        &self,
        endpoint: &Endpoint,
        local: bool,
        config: &TransportConfig,
    ) -> DataplaneResult<Arc<SmemServices>> {
        let addr = Self::address_of(endpoint)?.clone();
        let mut endpoint = endpoint.clone();

        if !local {
            endpoint.finalize();
            return Ok(Arc::new(SmemServices::new(endpoint, None, false, SmemBackend::Remote)?));
        }

        let listener = TcpListener::bind(addr.authority())
            .map_err(|e| DataplaneError::api("bind", format!("{}: {}", addr.authority(), e)))?;
        let bound = listener.local_addr()?.port();
        if addr.port == 0 {
            endpoint.set_socket_port(bound)?;
        }
        endpoint.finalize();

        let region = Arc::new(Region::new(endpoint.size()));
        let server = SocketServer::start(
            listener,
            region.clone(),
            config.socket.accept_poll,
            endpoint.to_string(),
        )?;
        info!(endpoint = %endpoint, port = bound, "Socket SMB listening");

        Ok(Arc::new(SmemServices::new(
            endpoint,
            Some(region),
            true,
            SmemBackend::Socket(server),
        )?))
    }

    fn create_connection(
        &self,
        source: &Arc<SmemServices>,
        target: &Arc<SmemServices>,
    ) -> DataplaneResult<Arc<dyn XferServices>> {
        let authority = Self::address_of(target.endpoint())?.authority();
        let stream = TcpStream::connect(&authority)
            .map_err(|e| DataplaneError::api("connect", format!("{}: {}", authority, e)))?;
        stream.set_nodelay(true)?;
        info!(source = %source.key(), target = %target.key(), "Socket connection established");

        Ok(Arc::new(SocketXferServices {
            source: source.clone(),
            target: target.clone(),
            stream: Arc::new(Mutex::new(stream)),
        }))
    }
}

/// Connection to one remote SMB; the stream is shared by every request
pub struct SocketXferServices {
    source: Arc<SmemServices>,
    target: Arc<SmemServices>,
    stream: Arc<Mutex<TcpStream>>,
}

impl XferServices for SocketXferServices {
    fn source(&self) -> &Arc<SmemServices> {
        &self.source
    }

    fn target(&self) -> &Arc<SmemServices> {
        &self.target
    }

    fn create_request(&self) -> DataplaneResult<Box<dyn XferRequest>> {
        Ok(Box::new(SocketXferRequest {
            source: self.source.region()?.clone(),
            target: self.target.key().to_string(),
            stream: self.stream.clone(),
            copies: Vec::new(),
            posted: false,
        }))
    }
}

impl Drop for SocketXferServices {
    fn drop(&mut self) {
        let _ = self.stream.lock().shutdown(Shutdown::Write);
    }
}

struct SocketXferRequest {
    source: Arc<Region>,
    target: String,
    stream: Arc<Mutex<TcpStream>>,
    copies: Vec<CopyOp>,
    posted: bool,
}

impl XferRequest for SocketXferRequest {
    fn copy(&mut self, src: Offset, dst: Offset, len: u64, flags: XferFlags) -> DataplaneResult<()> {
        if len > u32::MAX as u64 {
            return Err(DataplaneError::api("socket_copy", format!("{} bytes exceeds a frame", len)));
        }
        self.copies.push(CopyOp { src, dst, len, flags });
        Ok(())
    }

    fn post(&mut self) -> DataplaneResult<()> {
        let mut wire = Vec::new();
        for (count, op) in posting_order(&self.copies).into_iter().enumerate() {
            let header = FrameHeader {
                offset: op.dst,
                length: op.len as u32,
                count: count as u32,
            };
            wire.extend_from_slice(header.as_bytes());
            wire.extend_from_slice(&self.source.read_bytes(op.src, op.len)?);
        }

        self.stream.lock().write_all(&wire).map_err(|e| match e.kind() {
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                DataplaneError::SocketClosed {
                    endpoint: self.target.clone(),
                }
            }
            _ => DataplaneError::api("send", e),
        })?;
        self.posted = true;
        Ok(())
    }

    fn status(&mut self) -> DataplaneResult<CompletionStatus> {
        Ok(if self.posted {
            CompletionStatus::CompleteSuccess
        } else {
            CompletionStatus::Pending
        })
    }

    fn copy_count(&self) -> usize {
        self.copies.len()
    }
}
