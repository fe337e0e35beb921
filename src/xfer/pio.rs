/*!
 * PIO Driver
 * Host shared-memory regions resolved by name
 */

use super::local::LocalCopyServices;
use super::traits::{TransferDriver, XferServices};
use super::SmemBackend;
use crate::core::config::TransportConfig;
use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::types::MailboxId;
use crate::endpoint::{Endpoint, EndpointAddress, PioAddress, Protocol};
use crate::smb::{Region, SmemServices};
use ahash::RandomState;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Named regions visible to every transport sharing this namespace
pub struct PioNamespace {
    regions: DashMap<String, Arc<Region>, RandomState>,
}

impl PioNamespace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            regions: DashMap::with_hasher(RandomState::new()),
        })
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Region>> {
        self.regions.get(name).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Removes the name when the owning SMB goes away
pub struct PioRegistration {
    namespace: Arc<PioNamespace>,
    name: String,
}

impl Drop for PioRegistration {
    fn drop(&mut self) {
        self.namespace.regions.remove(&self.name);
        debug!(name = %self.name, "PIO region unlinked");
    }
}

pub struct PioDriver {
    namespace: Arc<PioNamespace>,
}

impl PioDriver {
    pub fn new(namespace: Arc<PioNamespace>) -> Self {
        Self { namespace }
    }

    fn name_of(endpoint: &Endpoint) -> DataplaneResult<&str> {
        match endpoint.address() {
            EndpointAddress::Pio(addr) => Ok(&addr.name),
            _ => Err(DataplaneError::unsupported(endpoint.to_string(), "not a PIO endpoint")),
        }
    }
}

impl TransferDriver for PioDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Pio
    }

    fn allocate_endpoint(
        &self,
        config: &TransportConfig,
        mailbox: MailboxId,
        max_mailboxes: u16,
    ) -> DataplaneResult<Endpoint> {
        let name = format!("smb-{}", Uuid::new_v4().simple());
        Endpoint::new(
            EndpointAddress::Pio(PioAddress { name }),
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
        let name = Self::name_of(endpoint)?.to_string();
        let mut endpoint = endpoint.clone();
        endpoint.finalize();

        if !local {
            let region = self
                .namespace
                .lookup(&name)
                .ok_or_else(|| DataplaneError::UnknownEndpoint {
                    endpoint: endpoint.to_string(),
                })?;
            return Ok(Arc::new(SmemServices::new(
                endpoint,
                Some(region),
                false,
                SmemBackend::Remote,
            )?));
        }

        let region = Arc::new(Region::new(endpoint.size()));
        match self.namespace.regions.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(DataplaneError::unsupported(
                    endpoint.to_string(),
                    "a region with this name already exists",
                ));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(region.clone());
            }
        }
        info!(name = %name, size = endpoint.size(), "PIO region created");

        let registration = PioRegistration {
            namespace: self.namespace.clone(),
            name,
        };
        Ok(Arc::new(SmemServices::new(
            endpoint,
            Some(region),
            true,
            SmemBackend::Pio(registration),
        )?))
    }

    fn create_connection(
        &self,
        source: &Arc<SmemServices>,
        target: &Arc<SmemServices>,
    ) -> DataplaneResult<Arc<dyn XferServices>> {
        Ok(Arc::new(LocalCopyServices::new(source.clone(), target.clone())?))
    }
}
