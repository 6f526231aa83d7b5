use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use super::credentials::NetworkCredentials;

/// MAC address of a station joined to our access point
pub type PeerId = [u8; 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Station,
    AccessPoint,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Station => write!(f, "STA"),
            LinkRole::AccessPoint => write!(f, "AP"),
        }
    }
}

/// Parameters of the local fallback network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointParams {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub max_clients: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkConfig {
    Station(NetworkCredentials),
    AccessPoint(AccessPointParams),
}

impl LinkConfig {
    pub fn role(&self) -> LinkRole {
        match self {
            LinkConfig::Station(_) => LinkRole::Station,
            LinkConfig::AccessPoint(_) => LinkRole::AccessPoint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Station got an address from the upstream network
    LinkUp(Ipv4Addr),
    LinkDown,
    StationJoined(PeerId),
    StationLeft(PeerId),
}

/// Callback the driver invokes from its own task. Implementations must not
/// block; the supervisor's sink only enqueues.
pub type EventSink = Arc<dyn Fn(LinkEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkError {
    pub op: &'static str,
    pub detail: String,
}

impl LinkError {
    pub fn new(op: &'static str, detail: impl Into<String>) -> Self {
        Self {
            op,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link driver {} failed: {}", self.op, self.detail)
    }
}

impl std::error::Error for LinkError {}

/// Radio role switching and connectivity events.
pub trait LinkDriver {
    fn set_mode(&mut self, role: LinkRole) -> Result<(), LinkError>;
    fn set_config(&mut self, config: &LinkConfig) -> Result<(), LinkError>;
    fn connect(&mut self) -> Result<(), LinkError>;
    fn disconnect(&mut self) -> Result<(), LinkError>;
    fn subscribe(&mut self, sink: EventSink) -> Result<(), LinkError>;
}

pub fn format_peer(peer: &PeerId) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        peer[0], peer[1], peer[2], peer[3], peer[4], peer[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ids_format_like_mac_addresses() {
        assert_eq!(format_peer(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]), "DE:AD:BE:EF:00:01");
    }

    #[test]
    fn config_reports_its_role() {
        let creds = NetworkCredentials::new("net", "").unwrap();
        assert_eq!(LinkConfig::Station(creds).role(), LinkRole::Station);
    }
}
