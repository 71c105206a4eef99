//! Dispatcher Registry Module
//!
//! Port-keyed registry guaranteeing one [`SerialDispatcher`] per physical
//! line. The registry is a plain value: build one per process (or per test)
//! and hand it to whatever constructs pump controllers.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::dispatcher::{DispatcherSettings, SerialDispatcher};
use crate::config::BusConfig;
use crate::error::{PumpError, Result};
use crate::transport::{BusIo, SerialTransportConfig};

/// Registry of open lines keyed by port identifier
///
/// Uses DashMap so lookups from concurrent device construction never block
/// each other.
#[derive(Default)]
pub struct DispatcherRegistry {
    dispatchers: DashMap<String, Arc<SerialDispatcher>>,
}

impl DispatcherRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher for `bus.port`, opening the serial port on first use
    pub fn get_or_open(&self, bus: &BusConfig) -> Result<Arc<SerialDispatcher>> {
        match self.dispatchers.entry(bus.port.clone()) {
            Entry::Occupied(entry) if !entry.get().is_closed() => {
                debug!("Reusing dispatcher for {}", bus.port);
                Ok(entry.get().clone())
            },
            Entry::Occupied(mut entry) => {
                let dispatcher = open_serial(bus)?;
                entry.insert(dispatcher.clone());
                Ok(dispatcher)
            },
            Entry::Vacant(entry) => {
                let dispatcher = open_serial(bus)?;
                entry.insert(dispatcher.clone());
                Ok(dispatcher)
            },
        }
    }

    /// Install a dispatcher over an arbitrary stream under `port`
    ///
    /// Fails if a live dispatcher already owns `port`.
    pub fn attach(
        &self,
        port: impl Into<String>,
        io: impl BusIo,
        settings: DispatcherSettings,
    ) -> Result<Arc<SerialDispatcher>> {
        let port = port.into();
        match self.dispatchers.entry(port.clone()) {
            Entry::Occupied(entry) if !entry.get().is_closed() => Err(PumpError::config(format!(
                "Port {port} already has a dispatcher"
            ))),
            Entry::Occupied(mut entry) => {
                let dispatcher = SerialDispatcher::spawn(port, io, settings);
                entry.insert(dispatcher.clone());
                Ok(dispatcher)
            },
            Entry::Vacant(entry) => {
                let dispatcher = SerialDispatcher::spawn(port, io, settings);
                entry.insert(dispatcher.clone());
                Ok(dispatcher)
            },
        }
    }

    /// Live dispatcher for `port`, if any
    pub fn get(&self, port: &str) -> Option<Arc<SerialDispatcher>> {
        self.dispatchers
            .get(port)
            .map(|d| d.clone())
            .filter(|d| !d.is_closed())
    }

    /// Close and forget the dispatcher for `port`
    pub async fn close(&self, port: &str) -> bool {
        let Some((_, dispatcher)) = self.dispatchers.remove(port) else {
            return false;
        };
        dispatcher.close().await;
        true
    }

    /// Close every dispatcher
    pub async fn close_all(&self) {
        let ports = self.ports();
        info!("Closing {} dispatcher(s)", ports.len());
        for port in ports {
            self.close(&port).await;
        }
    }

    pub fn ports(&self) -> Vec<String> {
        self.dispatchers.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }
}

fn open_serial(bus: &BusConfig) -> Result<Arc<SerialDispatcher>> {
    let stream = SerialTransportConfig::from(bus).open()?;
    Ok(SerialDispatcher::spawn(
        bus.port.clone(),
        stream,
        DispatcherSettings::from(bus),
    ))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attach_and_reuse() {
        let registry = DispatcherRegistry::new();
        let (near, _far) = tokio::io::duplex(64);
        let first = registry
            .attach("/dev/ttyTEST0", near, DispatcherSettings::default())
            .unwrap();

        let again = registry.get("/dev/ttyTEST0").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.len(), 1);

        let (other, _far2) = tokio::io::duplex(64);
        assert!(matches!(
            registry.attach("/dev/ttyTEST0", other, DispatcherSettings::default()),
            Err(PumpError::Configuration(_))
        ));

        registry.close_all().await;
        assert!(registry.is_empty());
        assert!(first.is_closed());
    }

    #[tokio::test]
    async fn test_close_unknown_port() {
        let registry = DispatcherRegistry::new();
        assert!(!registry.close("/dev/none").await);
        assert!(registry.get("/dev/none").is_none());
    }

    #[tokio::test]
    async fn test_get_or_open_missing_port_fails() {
        let registry = DispatcherRegistry::new();
        let bus = BusConfig {
            port: "/dev/pumpsrv-missing".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            registry.get_or_open(&bus),
            Err(PumpError::Transport(_))
        ));
        assert!(registry.is_empty());
    }
}
