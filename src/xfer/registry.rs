/*!
 * Driver Registry
 * Explicit table of compiled-in transfer backends
 */

use super::ofed::{OfedDriver, SoftFabric};
use super::pio::{PioDriver, PioNamespace};
use super::socket::SocketDriver;
use super::traits::TransferDriver;
use crate::core::config::TransportConfig;
use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::endpoint::Protocol;
use std::sync::Arc;
use tracing::debug;

/// Device name exposed by the default software fabric
pub const SOFT_FABRIC_DEVICE: &str = "soft0";

/// Backends available to one transport context, one per protocol
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn TransferDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Socket, a private PIO namespace and OFED over a private software fabric
    ///
    /// Transports that must reach each other through PIO or OFED in one
    /// process need a shared namespace or fabric; build those registries with
    /// [`with_driver`](Self::with_driver) instead.
    pub fn with_defaults(config: &TransportConfig) -> Self {
        Self::new()
            .with_driver(Arc::new(SocketDriver::new(config.socket.clone())))
            .with_driver(Arc::new(PioDriver::new(PioNamespace::new())))
            .with_driver(Arc::new(OfedDriver::new(
                SoftFabric::new(&[SOFT_FABRIC_DEVICE]),
                config.ofed.clone(),
            )))
    }

    /// Add a backend, replacing any earlier one for the same protocol
    pub fn with_driver(mut self, driver: Arc<dyn TransferDriver>) -> Self {
        self.register(driver);
        self
    }

    pub fn register(&mut self, driver: Arc<dyn TransferDriver>) {
        let protocol = driver.protocol();
        self.drivers.retain(|d| d.protocol() != protocol);
        debug!(protocol = %protocol, "Transfer driver registered");
        self.drivers.push(driver);
    }

    pub fn driver(&self, protocol: Protocol) -> DataplaneResult<&Arc<dyn TransferDriver>> {
        self.drivers
            .iter()
            .find(|d| d.protocol() == protocol)
            .ok_or_else(|| {
                DataplaneError::unsupported(
                    protocol.prefix(),
                    "no transfer driver registered for this protocol",
                )
            })
    }

    /// Driver for the protocol named by an endpoint string
    pub fn for_endpoint(&self, endpoint: &str) -> DataplaneResult<&Arc<dyn TransferDriver>> {
        self.driver(Protocol::of(endpoint)?)
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        self.drivers.iter().map(|d| d.protocol()).collect()
    }

    pub fn drivers(&self) -> impl Iterator<Item = &Arc<dyn TransferDriver>> {
        self.drivers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_cover_every_protocol() {
        let registry = DriverRegistry::with_defaults(&TransportConfig::default());
        let mut protocols = registry.protocols();
        protocols.sort_by_key(|p| p.prefix());
        assert_eq!(protocols.len(), Protocol::ALL.len());
        assert!(registry.for_endpoint("ocpi-smb-pio:x:65536.0.1").is_ok());
    }

    #[test]
    fn test_missing_protocol() {
        let registry = DriverRegistry::new()
            .with_driver(Arc::new(PioDriver::new(PioNamespace::new())));
        assert!(registry.driver(Protocol::Ofed).is_err());
        assert!(registry.for_endpoint("bogus:thing").is_err());
    }

    #[test]
    fn test_register_replaces_same_protocol() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(PioDriver::new(PioNamespace::new())));
        registry.register(Arc::new(PioDriver::new(PioNamespace::new())));
        assert_eq!(registry.protocols(), vec![Protocol::Pio]);
    }
}
