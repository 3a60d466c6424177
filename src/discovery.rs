use tracing::info;

/// Local-network service advertisement boundary. The actual mDNS/Bonjour
/// responder lives outside this crate; the host only asks for the service to
/// be advertised or withdrawn on a port.
pub trait Discovery: Send + Sync {
    fn advertise(&self, port: u16);
    fn unadvertise(&self);
}

/// Discovery adapter that records advertisement intent in the log, used when
/// no platform responder is wired in.
pub struct LogDiscovery {
    service_name: String,
}

impl LogDiscovery {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

impl Discovery for LogDiscovery {
    fn advertise(&self, port: u16) {
        info!(service = %self.service_name, port, "advertising service on local network");
    }

    fn unadvertise(&self) {
        info!(service = %self.service_name, "withdrawing local network advertisement");
    }
}
