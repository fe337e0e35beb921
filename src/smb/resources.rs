/*!
 * SMB Resources
 * Per-endpoint memory, allocator and backend state
 */

use super::allocator::ResourceAllocator;
use super::region::Region;
use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::endpoint::Endpoint;
use crate::mailbox::ContainerComms;
use crate::xfer::SmemBackend;
use std::sync::Arc;
use tracing::info;

/// SMB as seen by one participant: a finalized endpoint plus, when mapped, its bytes
pub struct SmemServices {
    endpoint: Endpoint,
    key: String,
    region: Option<Arc<Region>>,
    local: bool,
    backend: SmemBackend,
}

impl SmemServices {
    pub fn new(
        endpoint: Endpoint,
        region: Option<Arc<Region>>,
        local: bool,
        backend: SmemBackend,
    ) -> DataplaneResult<Self> {
        endpoint.ensure_finalized()?;
        if local && region.is_none() {
            return Err(DataplaneError::invalid_state(format!(
                "local SMB {} has no memory",
                endpoint
            )));
        }
        let key = endpoint.to_string();
        Ok(Self {
            endpoint,
            key,
            region,
            local,
            backend,
        })
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Canonical endpoint string
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.local
    }

    #[inline]
    pub fn backend(&self) -> &SmemBackend {
        &self.backend
    }

    /// Mapped memory; remote SMBs reached through a fabric have none
    pub fn region(&self) -> DataplaneResult<&Arc<Region>> {
        self.region
            .as_ref()
            .ok_or_else(|| DataplaneError::invalid_state(format!("SMB {} is not mapped", self.key)))
    }
}

impl std::fmt::Debug for SmemServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmemServices")
            .field("endpoint", &self.key)
            .field("local", &self.local)
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// SMB services plus the allocator of a locally owned SMB
///
/// Creating local resources installs the container comms block at offset 0,
/// so no port allocation ever lands there.
pub struct SmbResources {
    smem: Arc<SmemServices>,
    allocator: Option<ResourceAllocator>,
}

impl SmbResources {
    pub fn new_local(smem: Arc<SmemServices>) -> DataplaneResult<Self> {
        let region = smem.region()?.clone();
        let allocator = ResourceAllocator::new(smem.key(), region.size());
        ContainerComms::install(&region, &allocator, smem.endpoint())?;

        info!(
            endpoint = %smem.key(),
            size = region.size(),
            backend = smem.backend().name(),
            "Local SMB created"
        );

        Ok(Self {
            smem,
            allocator: Some(allocator),
        })
    }

    pub fn new_remote(smem: Arc<SmemServices>) -> Self {
        Self {
            smem,
            allocator: None,
        }
    }

    #[inline]
    pub fn smem(&self) -> &Arc<SmemServices> {
        &self.smem
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        self.smem.endpoint()
    }

    #[inline]
    pub fn key(&self) -> &str {
        self.smem.key()
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.allocator.is_some()
    }

    pub fn region(&self) -> DataplaneResult<&Arc<Region>> {
        self.smem.region()
    }

    pub fn allocator(&self) -> DataplaneResult<&ResourceAllocator> {
        self.allocator.as_ref().ok_or_else(|| {
            DataplaneError::invalid_state(format!("SMB {} is remote and has no allocator", self.key()))
        })
    }
}
