//! Station / access-point switching on `EspWifi`.
//!
//! Connectivity is reported through the system event loop. Payloads are
//! read back through the IDF C API (station list, netif address) rather
//! than from the event structs.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::{EspSubscription, EspSystemEventLoop, System};
use esp_idf_svc::netif::IpEvent;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi, WifiEvent,
};

use crate::network::link::{
    EventSink, LinkConfig, LinkDriver, LinkError, LinkEvent, LinkRole, PeerId,
};

const STA_IFKEY: &[u8] = b"WIFI_STA_DEF\0";

pub struct WifiLink {
    wifi: EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
    role: LinkRole,
    shared: Arc<Shared>,
    subscriptions: Vec<EspSubscription<'static, System>>,
}

/// State the event callbacks share with the driver
#[derive(Default)]
struct Shared {
    /// Station association is up
    associated: AtomicBool,
    /// Swallow the next station disconnect, it was requested by us
    expect_disconnect: AtomicBool,
    access_point: AtomicBool,
    peers: Mutex<BTreeSet<PeerId>>,
}

impl WifiLink {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        hostname: &str,
    ) -> Result<Self> {
        let mut wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
        if let Err(e) = wifi.sta_netif_mut().set_hostname(hostname) {
            log::warn!("Could not set DHCP hostname '{}': {}", hostname, e);
        }
        log::info!("WiFi driver initialized");
        Ok(Self {
            wifi,
            sys_loop,
            role: LinkRole::Station,
            shared: Arc::new(Shared::default()),
            subscriptions: Vec::new(),
        })
    }

    fn stop_radio(&mut self) -> Result<(), LinkError> {
        let started = self.wifi.is_started().map_err(|e| LinkError::new("stop", e.to_string()))?;
        if started {
            if self.shared.associated.load(Ordering::Acquire) {
                self.shared.expect_disconnect.store(true, Ordering::Release);
            }
            self.wifi.stop().map_err(|e| LinkError::new("stop", e.to_string()))?;
        }
        Ok(())
    }
}

fn client_configuration(config: &LinkConfig) -> Result<Configuration, LinkError> {
    let invalid = |what: &str| LinkError::new("set_config", format!("{} does not fit", what));
    Ok(match config {
        LinkConfig::Station(credentials) => Configuration::Client(ClientConfiguration {
            ssid: credentials.ssid().try_into().map_err(|_| invalid("SSID"))?,
            password: credentials.passphrase().try_into().map_err(|_| invalid("passphrase"))?,
            auth_method: if credentials.is_open() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        }),
        LinkConfig::AccessPoint(params) => Configuration::AccessPoint(AccessPointConfiguration {
            ssid: params.ssid.as_str().try_into().map_err(|_| invalid("AP SSID"))?,
            password: params.password.as_str().try_into().map_err(|_| invalid("AP password"))?,
            auth_method: if params.password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            channel: params.channel,
            max_connections: params.max_clients,
            ..Default::default()
        }),
    })
}

/// Current address of the station interface
fn station_address() -> Option<Ipv4Addr> {
    unsafe {
        let netif = esp_idf_sys::esp_netif_get_handle_from_ifkey(STA_IFKEY.as_ptr() as *const _);
        if netif.is_null() {
            return None;
        }
        let mut info: esp_idf_sys::esp_netif_ip_info_t = core::mem::zeroed();
        if esp_idf_sys::esp_netif_get_ip_info(netif, &mut info) != esp_idf_sys::ESP_OK {
            return None;
        }
        // lwIP keeps the address in network byte order
        Some(Ipv4Addr::from(info.ip.addr.to_le_bytes()))
    }
}

/// MACs of the stations currently joined to the soft-AP
fn joined_stations() -> BTreeSet<PeerId> {
    let mut list: esp_idf_sys::wifi_sta_list_t = unsafe { core::mem::zeroed() };
    if unsafe { esp_idf_sys::esp_wifi_ap_get_sta_list(&mut list) } != esp_idf_sys::ESP_OK {
        return BTreeSet::new();
    }
    let count = usize::try_from(list.num).unwrap_or(0).min(list.sta.len());
    list.sta[..count].iter().map(|sta| sta.mac).collect()
}

/// Emits joins and leaves by diffing against the last known station list
fn sync_peers(shared: &Shared, sink: &EventSink) {
    let current = joined_stations();
    let mut known = shared.peers.lock().unwrap_or_else(PoisonError::into_inner);
    for peer in current.difference(&known) {
        sink(LinkEvent::StationJoined(*peer));
    }
    for peer in known.difference(&current) {
        sink(LinkEvent::StationLeft(*peer));
    }
    *known = current;
}

impl LinkDriver for WifiLink {
    fn set_mode(&mut self, role: LinkRole) -> Result<(), LinkError> {
        self.stop_radio()?;
        self.role = role;
        self.shared
            .access_point
            .store(role == LinkRole::AccessPoint, Ordering::Release);
        self.shared
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        log::debug!("Radio role set to {}", role);
        Ok(())
    }

    /// Applies the configuration and starts the radio. In AP role the
    /// network is up once this returns.
    fn set_config(&mut self, config: &LinkConfig) -> Result<(), LinkError> {
        if config.role() != self.role {
            return Err(LinkError::new(
                "set_config",
                format!("{} configuration while in {} role", config.role(), self.role),
            ));
        }
        let configuration = client_configuration(config)?;
        self.stop_radio()?;
        self.wifi
            .set_configuration(&configuration)
            .map_err(|e| LinkError::new("set_config", e.to_string()))?;
        self.wifi.start().map_err(|e| LinkError::new("start", e.to_string()))?;
        Ok(())
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        if self.role != LinkRole::Station {
            return Err(LinkError::new("connect", "radio is in AP role"));
        }
        self.wifi.connect().map_err(|e| LinkError::new("connect", e.to_string()))
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        match self.role {
            LinkRole::Station => {
                let started = self
                    .wifi
                    .is_started()
                    .map_err(|e| LinkError::new("disconnect", e.to_string()))?;
                if !started {
                    return Ok(());
                }
                if self.shared.associated.load(Ordering::Acquire) {
                    self.shared.expect_disconnect.store(true, Ordering::Release);
                }
                self.wifi
                    .disconnect()
                    .map_err(|e| LinkError::new("disconnect", e.to_string()))
            }
            LinkRole::AccessPoint => self.stop_radio(),
        }
    }

    fn subscribe(&mut self, sink: EventSink) -> Result<(), LinkError> {
        let shared = self.shared.clone();
        let wifi_sink = sink.clone();
        let wifi_events = self
            .sys_loop
            .subscribe::<WifiEvent, _>(move |event| match event {
                WifiEvent::StaConnected(..) => {
                    shared.associated.store(true, Ordering::Release);
                }
                WifiEvent::StaDisconnected(..) => {
                    shared.associated.store(false, Ordering::Release);
                    if shared.expect_disconnect.swap(false, Ordering::AcqRel) {
                        log::debug!("Requested station disconnect completed");
                    } else {
                        wifi_sink(LinkEvent::LinkDown);
                    }
                }
                WifiEvent::ApStaConnected(..) | WifiEvent::ApStaDisconnected(..) => {
                    if shared.access_point.load(Ordering::Acquire) {
                        sync_peers(&shared, &wifi_sink);
                    }
                }
                _ => {}
            })
            .map_err(|e| LinkError::new("subscribe", e.to_string()))?;

        let ip_events = self
            .sys_loop
            .subscribe::<IpEvent, _>(move |event| {
                if let IpEvent::DhcpIpAssigned(..) = event {
                    match station_address() {
                        Some(address) => sink(LinkEvent::LinkUp(address)),
                        None => log::warn!("DHCP lease reported but no station address"),
                    }
                }
            })
            .map_err(|e| LinkError::new("subscribe", e.to_string()))?;

        self.subscriptions.push(wifi_events);
        self.subscriptions.push(ip_events);
        log::debug!("Subscribed to WiFi and IP events");
        Ok(())
    }
}
