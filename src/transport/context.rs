/*!
 * Transport Context
 * Explicitly scoped state shared by every circuit of one participant
 *
 * Holds the driver registry, the SMBs this participant created or attached
 * to, and one cached connection per ordered (source, target) SMB pair.
 */

use super::events::EventManager;
use crate::core::config::TransportConfig;
use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::types::MailboxId;
use crate::endpoint::{Endpoint, Protocol};
use crate::monitoring::DataplaneStats;
use crate::smb::SmbResources;
use crate::xfer::{DriverRegistry, LocalCopyServices, XferServices};
use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

type ServicesKey = (String, String);

pub struct TransportContext {
    config: TransportConfig,
    registry: DriverRegistry,
    resources: DashMap<String, Arc<SmbResources>, RandomState>,
    services: DashMap<ServicesKey, Arc<dyn XferServices>, RandomState>,
    events: EventManager,
    stats: Arc<DataplaneStats>,
}

impl TransportContext {
    pub fn new(config: TransportConfig, registry: DriverRegistry) -> DataplaneResult<Arc<Self>> {
        config.validate()?;
        info!(
            smb_size = config.smb_size,
            use_events = config.use_events,
            protocols = ?registry.protocols(),
            "Transport context created"
        );
        Ok(Arc::new(Self {
            events: EventManager::new(config.use_events),
            config,
            registry,
            resources: DashMap::with_hasher(RandomState::new()),
            services: DashMap::with_hasher(RandomState::new()),
            stats: Arc::new(DataplaneStats::new()),
        }))
    }

    /// Context with every compiled-in backend on private namespaces
    pub fn with_defaults(config: TransportConfig) -> DataplaneResult<Arc<Self>> {
        let registry = DriverRegistry::with_defaults(&config);
        Self::new(config, registry)
    }

    #[inline]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    #[inline]
    pub fn events(&self) -> &EventManager {
        &self.events
    }

    #[inline]
    pub fn stats(&self) -> &Arc<DataplaneStats> {
        &self.stats
    }

    /// Create a local SMB with a driver-assigned address
    pub fn create_local(
        &self,
        protocol: Protocol,
        mailbox: MailboxId,
        max_mailboxes: u16,
    ) -> DataplaneResult<Arc<SmbResources>> {
        let driver = self.registry.driver(protocol)?;
        let endpoint = driver.allocate_endpoint(&self.config, mailbox, max_mailboxes)?;
        self.create_local_at(&endpoint)
    }

    /// Create a local SMB at an explicit (unfinalized) endpoint string
    pub fn create_local_from(&self, endpoint: &str) -> DataplaneResult<Arc<SmbResources>> {
        self.create_local_at(&Endpoint::parse(endpoint)?)
    }

    fn create_local_at(&self, endpoint: &Endpoint) -> DataplaneResult<Arc<SmbResources>> {
        let driver = self.registry.driver(endpoint.protocol())?;
        let smem = driver.connect(endpoint, true, &self.config)?;
        let resources = Arc::new(SmbResources::new_local(smem)?);

        match self.resources.entry(resources.key().to_string()) {
            Entry::Occupied(_) => Err(DataplaneError::invalid_state(format!(
                "endpoint {} is already in use",
                resources.key()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(resources.clone());
                Ok(resources)
            }
        }
    }

    /// Resources behind an endpoint, attaching to remote SMBs on first use
    pub fn resources(&self, endpoint: &str) -> DataplaneResult<Arc<SmbResources>> {
        if let Some(existing) = self.resources.get(endpoint) {
            return Ok(existing.value().clone());
        }

        let parsed = Endpoint::parse_finalized(endpoint)?;
        let driver = self.registry.driver(parsed.protocol())?;
        let smem = driver.connect(&parsed, false, &self.config)?;
        let attached = Arc::new(SmbResources::new_remote(smem));
        debug!(endpoint = %endpoint, "Attached to remote SMB");

        Ok(self
            .resources
            .entry(endpoint.to_string())
            .or_insert(attached)
            .value()
            .clone())
    }

    /// True only for SMBs created by this context
    pub fn is_local(&self, endpoint: &str) -> bool {
        self.resources
            .get(endpoint)
            .map(|r| r.is_local())
            .unwrap_or(false)
    }

    pub fn local_resources(&self) -> Vec<Arc<SmbResources>> {
        self.resources
            .iter()
            .filter(|entry| entry.value().is_local())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Connection from a local SMB to any SMB
    ///
    /// Returns `None` while an out-of-band handshake is still outstanding.
    pub fn services(
        &self,
        source: &str,
        target: &str,
    ) -> DataplaneResult<Option<Arc<dyn XferServices>>> {
        let key = (source.to_string(), target.to_string());
        let services = match self.services.entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(slot) => {
                let created = self.connect(source, target)?;
                slot.insert(created.clone());
                created
            }
        };
        Ok(services.poll_handshake()?.then_some(services))
    }

    fn connect(&self, source: &str, target: &str) -> DataplaneResult<Arc<dyn XferServices>> {
        let src = self.resources(source)?;
        if !src.is_local() {
            return Err(DataplaneError::invalid_state(format!(
                "connection source {} is not a local SMB",
                source
            )));
        }
        let tgt = self.resources(target)?;

        if tgt.is_local() {
            return Ok(Arc::new(LocalCopyServices::new(
                src.smem().clone(),
                tgt.smem().clone(),
            )?));
        }
        if src.endpoint().protocol() != tgt.endpoint().protocol() {
            return Err(DataplaneError::unsupported(
                target,
                format!("cannot reach from {}", src.endpoint().protocol()),
            ));
        }

        let driver = self.registry.driver(src.endpoint().protocol())?;
        let services = driver.create_connection(src.smem(), tgt.smem())?;
        debug!(source = %source, target = %target, "Transfer connection created");
        Ok(services)
    }

    /// Create the reverse side of every handshake remote peers started
    pub fn accept_handshakes(&self) -> DataplaneResult<usize> {
        let mut accepted = 0;
        for local in self.local_resources() {
            let Ok(driver) = self.registry.driver(local.endpoint().protocol()) else {
                continue;
            };
            for remote in driver.pending_handshakes(local.smem()) {
                if self.services(local.key(), &remote)?.is_some() {
                    accepted += 1;
                }
            }
        }
        Ok(accepted)
    }

    /// Forget a local SMB and every connection touching it
    pub fn release_local(&self, endpoint: &str) -> bool {
        self.services
            .retain(|(source, target), _| source != endpoint && target != endpoint);
        self.resources.remove(endpoint).is_some()
    }
}
