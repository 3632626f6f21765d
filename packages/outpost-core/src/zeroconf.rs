//! mDNS service registration for server discovery.
//!
//! Best-effort: failure is logged and the satellite keeps running. Only
//! meaningful with a TCP listener.

use std::sync::atomic::{AtomicBool, Ordering};

use mdns_sd::{ServiceDaemon, ServiceInfo};

use crate::error::{SatelliteError, SatelliteResult};

/// Service type servers browse for.
const SERVICE_TYPE: &str = "_wyoming._tcp.local.";

/// Registers the satellite with the local mDNS responder. The service is
/// unregistered on [`ZeroconfAdvertiser::shutdown`] or drop.
pub struct ZeroconfAdvertiser {
    daemon: ServiceDaemon,
    service_fullname: String,
    shutdown_called: AtomicBool,
}

impl ZeroconfAdvertiser {
    /// Registers `name` at `port`. With `host = None` the responder
    /// advertises all detected interface addresses.
    pub fn new(name: &str, host: Option<&str>, port: u16) -> SatelliteResult<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|err| SatelliteError::Config(format!("mDNS daemon: {err}")))?;

        let hostname = format!("{}.local.", name);
        let mut service = ServiceInfo::new(
            SERVICE_TYPE,
            name,
            &hostname,
            host.unwrap_or(""),
            port,
            None::<std::collections::HashMap<String, String>>,
        )
        .map_err(|err| SatelliteError::Config(format!("mDNS service: {err}")))?;
        if host.is_none() {
            service = service.enable_addr_auto();
        }

        let fullname = service.get_fullname().to_string();
        daemon
            .register(service)
            .map_err(|err| SatelliteError::Config(format!("mDNS register: {err}")))?;

        log::debug!("Zeroconf discovery enabled (name={}, port={})", name, port);

        Ok(Self {
            daemon,
            service_fullname: fullname,
            shutdown_called: AtomicBool::new(false),
        })
    }

    /// Unregisters the service. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.daemon.unregister(&self.service_fullname) {
            log::warn!("Could not unregister mDNS service: {}", err);
        }
    }
}

impl Drop for ZeroconfAdvertiser {
    fn drop(&mut self) {
        self.shutdown();
    }
}
