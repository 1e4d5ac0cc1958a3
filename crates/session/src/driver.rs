//! Driver entry object
//!
//! Owns the registry and receives the platform's lifecycle events: attach,
//! detach, suspend, resume and the two halves of a device reset. Clients come
//! in through [`Driver::open`].

use crate::config::SessionConfig;
use crate::device::DeviceSession;
use crate::error::{Result, SessionError};
use crate::handle::ClientHandle;
use crate::power::PowerPolicy;
use crate::registry::SessionRegistry;
use crate::transfer::{Direction, Endpoint, Transport};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// USB transfer type of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub kind: TransferKind,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }

    pub fn is_bulk_in(&self) -> bool {
        self.kind == TransferKind::Bulk && self.direction() == Direction::In
    }

    pub fn is_bulk_out(&self) -> bool {
        self.kind == TransferKind::Bulk && self.direction() == Direction::Out
    }

    fn to_endpoint(self) -> Endpoint {
        Endpoint::new(self.address, usize::from(self.max_packet_size))
    }
}

/// The interface offered on attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    /// First bulk-in and first bulk-out endpoint, if both exist
    pub fn bulk_pair(&self) -> Option<(Endpoint, Endpoint)> {
        let bulk_in = self
            .endpoints
            .iter()
            .find(|e| e.is_bulk_in() && e.max_packet_size > 0)?;
        let bulk_out = self.endpoints.iter().find(|e| e.is_bulk_out())?;
        Some((bulk_in.to_endpoint(), bulk_out.to_endpoint()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub nonblocking: bool,
}

pub struct Driver {
    config: SessionConfig,
    power: Arc<dyn PowerPolicy>,
    registry: SessionRegistry,
}

impl Driver {
    pub fn new(config: SessionConfig, power: Arc<dyn PowerPolicy>) -> Self {
        let registry = SessionRegistry::new(config.minor_base, config.max_minors);
        Self {
            config,
            power,
            registry,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Probe an interface and publish a session for it
    pub fn on_attach(
        &self,
        interface: &InterfaceDescriptor,
        transport: Arc<dyn Transport>,
    ) -> Result<u32> {
        let Some((bulk_in, bulk_out)) = interface.bulk_pair() else {
            warn!(
                "Interface {} lacks a bulk-in/bulk-out pair ({} endpoint(s))",
                interface.number,
                interface.endpoints.len()
            );
            return Err(SessionError::NoEndpoints);
        };

        let session = DeviceSession::new(
            interface.number,
            Some(bulk_in),
            bulk_out,
            transport,
            Arc::clone(&self.power),
            self.config.clone(),
        );
        let minor = self.registry.register(session)?;

        info!(
            "Attached interface {} as minor {} (in {:#04x}/{} bytes, out {:#04x})",
            interface.number,
            minor,
            bulk_in.address,
            bulk_in.max_packet_size,
            bulk_out.address
        );
        Ok(minor)
    }

    pub async fn on_detach(&self, minor: u32) -> Result<()> {
        let session = self
            .registry
            .unregister(minor)
            .ok_or(SessionError::NotFound(minor))?;
        session.disconnect().await;
        Ok(())
    }

    pub async fn on_suspend(&self, minor: u32) -> Result<()> {
        self.registry.lookup_and_acquire(minor)?.suspend().await;
        Ok(())
    }

    pub async fn on_resume(&self, minor: u32) -> Result<()> {
        self.registry.lookup_and_acquire(minor)?.resume().await;
        Ok(())
    }

    pub async fn on_pre_reset(&self, minor: u32) -> Result<()> {
        self.registry.lookup_and_acquire(minor)?.pre_reset().await;
        Ok(())
    }

    pub async fn on_post_reset(&self, minor: u32) -> Result<()> {
        self.registry.lookup_and_acquire(minor)?.post_reset().await;
        Ok(())
    }

    /// Open a client handle on the session registered under `minor`
    pub async fn open(&self, minor: u32, flags: OpenFlags) -> Result<ClientHandle> {
        let session = self.registry.lookup_and_acquire(minor)?;
        session.open().await?;
        debug!(
            "New handle on minor {} (nonblocking: {})",
            minor, flags.nonblocking
        );
        Ok(ClientHandle::new(session, flags.nonblocking))
    }

    /// Detach every registered session
    pub async fn shutdown(&self) {
        let sessions = self.registry.drain();
        if !sessions.is_empty() {
            info!("Shutting down {} session(s)", sessions.len());
        }
        for session in sessions {
            session.disconnect().await;
        }
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPower, MockTransport};

    fn bulk(address: u8, max_packet_size: u16) -> EndpointDescriptor {
        EndpointDescriptor {
            address,
            kind: TransferKind::Bulk,
            max_packet_size,
        }
    }

    #[test]
    fn test_bulk_pair_takes_first_of_each() {
        let interface = InterfaceDescriptor {
            number: 0,
            endpoints: vec![
                EndpointDescriptor {
                    address: 0x83,
                    kind: TransferKind::Interrupt,
                    max_packet_size: 8,
                },
                bulk(0x81, 512),
                bulk(0x02, 512),
                bulk(0x82, 64),
                bulk(0x04, 64),
            ],
        };
        let (bulk_in, bulk_out) = interface.bulk_pair().unwrap();
        assert_eq!(bulk_in, Endpoint::new(0x81, 512));
        assert_eq!(bulk_out, Endpoint::new(0x02, 512));
    }

    #[test]
    fn test_attach_without_bulk_out_fails() {
        let driver = Driver::new(SessionConfig::default(), MockPower::new());
        let interface = InterfaceDescriptor {
            number: 0,
            endpoints: vec![bulk(0x81, 64)],
        };
        assert_eq!(
            driver.on_attach(&interface, MockTransport::new()),
            Err(SessionError::NoEndpoints)
        );
        assert!(driver.registry().is_empty());
    }

    #[test]
    fn test_unvalidated_minor_range_exhausts_instead_of_overflowing() {
        let config = SessionConfig {
            minor_base: u32::MAX,
            max_minors: 16,
            ..Default::default()
        };
        let driver = Driver::new(config, MockPower::new());
        let interface = InterfaceDescriptor {
            number: 0,
            endpoints: vec![bulk(0x81, 64), bulk(0x02, 64)],
        };
        assert_eq!(
            driver.on_attach(&interface, MockTransport::new()),
            Err(SessionError::ResourceExhausted)
        );
    }

    #[tokio::test]
    async fn test_lifecycle_hooks_need_registered_minor() {
        let driver = Driver::new(SessionConfig::default(), MockPower::new());
        assert_eq!(driver.on_detach(192).await, Err(SessionError::NotFound(192)));
        assert_eq!(driver.on_suspend(192).await, Err(SessionError::NotFound(192)));
        assert!(matches!(
            driver.open(192, OpenFlags::default()).await,
            Err(SessionError::NotFound(192))
        ));
    }

    #[tokio::test]
    async fn test_attach_open_detach() {
        let driver = Driver::new(SessionConfig::default(), MockPower::new());
        let interface = InterfaceDescriptor {
            number: 1,
            endpoints: vec![bulk(0x81, 64), bulk(0x02, 64)],
        };

        let minor = driver.on_attach(&interface, MockTransport::new()).unwrap();
        assert_eq!(minor, 192);

        let handle = driver.open(minor, OpenFlags::default()).await.unwrap();
        assert_eq!(handle.minor(), minor);

        driver.on_detach(minor).await.unwrap();
        assert!(driver.registry().is_empty());
        // The handle keeps the session alive after detach
        assert!(handle.device().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_detaches_everything() {
        let driver = Driver::new(SessionConfig::default(), MockPower::new());
        let interface = InterfaceDescriptor {
            number: 0,
            endpoints: vec![bulk(0x81, 64), bulk(0x02, 64)],
        };
        driver.on_attach(&interface, MockTransport::new()).unwrap();
        driver.on_attach(&interface, MockTransport::new()).unwrap();

        driver.shutdown().await;
        assert!(driver.registry().is_empty());
    }
}
