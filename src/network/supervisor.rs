//! Network mode supervisor.
//!
//! Owns [`NetworkState`] and the service handle; nothing else writes them.
//! Link callbacks and HTTP handlers talk to it through a [`SupervisorHandle`]
//! that enqueues [`SupervisorEvent`]s and reads a published
//! [`NetworkSnapshot`]. Events are processed one at a time to completion on
//! the supervisor's own thread; `tick` drives the timers.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::credentials::NetworkCredentials;
use super::link::{format_peer, EventSink, LinkConfig, LinkDriver, LinkError, LinkEvent, LinkRole, PeerId};
use super::service::{ServiceError, ServiceFactory, ServiceHandle, ServiceManager};
use crate::config::SupervisorConfig;
use crate::store::{self, SharedStore};

const TICK_INTERVAL: Duration = Duration::from_millis(250);
const FAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    Idle,
    ConnectingSta,
    StationConnected,
    ApFallback,
    Reconfiguring,
    /// A driver call failed; waiting to retry the startup decision
    Faulted,
}

impl NetworkMode {
    /// Modes in which the network-facing service must be running
    pub fn serves(self) -> bool {
        matches!(self, NetworkMode::StationConnected | NetworkMode::ApFallback)
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkMode::Idle => "Idle",
            NetworkMode::ConnectingSta => "ConnectingSTA",
            NetworkMode::StationConnected => "StationConnected",
            NetworkMode::ApFallback => "APFallback",
            NetworkMode::Reconfiguring => "Reconfiguring",
            NetworkMode::Faulted => "Faulted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    pub mode: NetworkMode,
    pub retry_count: u32,
    pub seconds_in_ap: u64,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            mode: NetworkMode::Idle,
            retry_count: 0,
            seconds_in_ap: 0,
        }
    }
}

/// Read-only view published after every event and tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSnapshot {
    pub mode: NetworkMode,
    pub retries: u32,
    pub ap_seconds: u64,
    pub address: Option<Ipv4Addr>,
    pub peers: usize,
    pub ssid: Option<String>,
}

impl Default for NetworkSnapshot {
    fn default() -> Self {
        Self {
            mode: NetworkMode::Idle,
            retries: 0,
            ap_seconds: 0,
            address: None,
            peers: 0,
            ssid: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Link(LinkEvent),
    ApplyCredentials(NetworkCredentials),
    Shutdown,
}

/// The supervisor thread has exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorGone;

impl fmt::Display for SupervisorGone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "network supervisor is not running")
    }
}

impl std::error::Error for SupervisorGone {}

/// Cloneable sender side used by every other task
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: Sender<SupervisorEvent>,
    snapshot: Arc<RwLock<NetworkSnapshot>>,
}

impl SupervisorHandle {
    pub fn apply_credentials(&self, credentials: NetworkCredentials) -> Result<(), SupervisorGone> {
        self.send(SupervisorEvent::ApplyCredentials(credentials))
    }

    pub fn shutdown(&self) -> Result<(), SupervisorGone> {
        self.send(SupervisorEvent::Shutdown)
    }

    pub fn send(&self, event: SupervisorEvent) -> Result<(), SupervisorGone> {
        self.tx.send(event).map_err(|_| SupervisorGone)
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Sink to hand to the link driver; it only enqueues.
    pub fn link_sink(&self) -> EventSink {
        let tx = self.tx.clone();
        Arc::new(move |event| {
            if tx.send(SupervisorEvent::Link(event)).is_err() {
                log::debug!("Dropping link event {:?}: supervisor gone", event);
            }
        })
    }
}

/// Receiving side, consumed by [`Supervisor::new`]
pub struct SupervisorInbox {
    rx: Receiver<SupervisorEvent>,
    snapshot: Arc<RwLock<NetworkSnapshot>>,
    sink: SupervisorHandle,
}

/// Creates the event queue before the supervisor exists, so collaborators
/// that need a handle (the HTTP service factory) can be built first.
pub fn channel() -> (SupervisorHandle, SupervisorInbox) {
    let (tx, rx) = mpsc::channel();
    let snapshot = Arc::new(RwLock::new(NetworkSnapshot::default()));
    let handle = SupervisorHandle {
        tx,
        snapshot: snapshot.clone(),
    };
    let inbox = SupervisorInbox {
        rx,
        snapshot,
        sink: handle.clone(),
    };
    (handle, inbox)
}

#[derive(Debug)]
enum DriverFailure {
    Link(LinkError),
    Service(ServiceError),
}

impl fmt::Display for DriverFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverFailure::Link(e) => write!(f, "{}", e),
            DriverFailure::Service(e) => write!(f, "{}", e),
        }
    }
}

impl From<LinkError> for DriverFailure {
    fn from(e: LinkError) -> Self {
        DriverFailure::Link(e)
    }
}

impl From<ServiceError> for DriverFailure {
    fn from(e: ServiceError) -> Self {
        DriverFailure::Service(e)
    }
}

pub struct Supervisor<L: LinkDriver, F: ServiceFactory> {
    config: SupervisorConfig,
    link: L,
    services: ServiceManager<F>,
    store: SharedStore,
    inbox: SupervisorInbox,

    state: NetworkState,
    service: Option<ServiceHandle>,
    credentials: Option<NetworkCredentials>,
    address: Option<Ipv4Addr>,
    peers: BTreeSet<PeerId>,
    subscribed: bool,
    /// Role of the most recent bring-up attempt
    target: LinkRole,
    /// Consecutive driver failures while bringing up or holding the station
    station_faults: u32,

    connect_deadline: Option<Instant>,
    ap_entered_at: Option<Instant>,
    peers_empty_since: Option<Instant>,
    fault_backoff: Option<Duration>,
    fault_retry_at: Option<Instant>,
}

impl<L: LinkDriver, F: ServiceFactory> Supervisor<L, F> {
    pub fn new(
        config: SupervisorConfig,
        link: L,
        factory: F,
        store: SharedStore,
        inbox: SupervisorInbox,
    ) -> Self {
        Self {
            config,
            link,
            services: ServiceManager::new(factory),
            store,
            inbox,
            state: NetworkState::default(),
            service: None,
            credentials: None,
            address: None,
            peers: BTreeSet::new(),
            subscribed: false,
            target: LinkRole::Station,
            station_faults: 0,
            connect_deadline: None,
            ap_entered_at: None,
            peers_empty_since: None,
            fault_backoff: None,
            fault_retry_at: None,
        }
    }

    /// Subscribes to the link driver and leaves Idle: stored credentials go
    /// to ConnectingSTA, none to APFallback.
    pub fn start(&mut self, now: Instant) {
        self.credentials = match store::with_store(&self.store, |s| store::load_credentials(s)) {
            Ok(credentials) => credentials,
            Err(e) => {
                log::warn!("Could not read stored credentials: {}", e);
                None
            }
        };

        if let Err(e) = self.decide(now) {
            self.fault(now, e);
        }
        self.publish();
    }

    /// Processes one event to completion. Returns `false` once shut down.
    pub fn handle_event(&mut self, event: SupervisorEvent, now: Instant) -> bool {
        match event {
            SupervisorEvent::Link(link_event) => self.on_link_event(link_event, now),
            SupervisorEvent::ApplyCredentials(credentials) => self.reconfigure(credentials, now),
            SupervisorEvent::Shutdown => {
                self.shutdown();
                self.publish();
                return false;
            }
        }
        self.check_invariants();
        self.publish();
        true
    }

    /// Advances the connect timeout, the AP probe and fault recovery.
    pub fn tick(&mut self, now: Instant) {
        match self.state.mode {
            NetworkMode::ConnectingSta => {
                if self.connect_deadline.is_some_and(|deadline| now >= deadline) {
                    log::warn!(
                        "No link-up within {} ms, falling back to AP",
                        self.config.connect_timeout_ms
                    );
                    self.fall_back_to_ap(now);
                }
            }
            NetworkMode::ApFallback => {
                if let Some(entered) = self.ap_entered_at {
                    self.state.seconds_in_ap = now.saturating_duration_since(entered).as_secs();
                }
                let idle_long_enough = self
                    .peers_empty_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= self.config.ap_probe_interval());
                if idle_long_enough && self.credentials.is_some() {
                    log::info!("AP idle with no peers, probing station network");
                    self.probe_station(now);
                }
            }
            NetworkMode::Faulted => {
                if self.fault_retry_at.is_some_and(|at| now >= at) {
                    log::info!("Retrying network bring-up after fault");
                    self.fault_retry_at = None;
                    if let Err(e) = self.decide(now) {
                        self.fault(now, e);
                    }
                }
            }
            _ => {}
        }
        self.check_invariants();
        self.publish();
    }

    /// Drains queued events without blocking, then ticks once. Returns
    /// `false` once shut down.
    pub fn pump(&mut self, now: Instant) -> bool {
        loop {
            match self.inbox.rx.try_recv() {
                Ok(event) => {
                    if !self.handle_event(event, now) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.shutdown();
                    return false;
                }
            }
        }
        self.tick(now);
        true
    }

    /// Event loop for the supervisor's thread. Returns after `Shutdown`.
    pub fn run(mut self) {
        self.start(Instant::now());
        loop {
            match self.inbox.rx.recv_timeout(TICK_INTERVAL) {
                Ok(event) => {
                    if !self.handle_event(event, Instant::now()) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.shutdown();
                    break;
                }
            }
            self.tick(Instant::now());
        }
        log::info!("Network supervisor stopped");
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    pub fn service(&self) -> Option<ServiceHandle> {
        self.service
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            mode: self.state.mode,
            retries: self.state.retry_count,
            ap_seconds: self.state.seconds_in_ap,
            address: self.address,
            peers: self.peers.len(),
            ssid: self.credentials.as_ref().map(|c| c.ssid().to_string()),
        }
    }

    fn on_link_event(&mut self, event: LinkEvent, now: Instant) {
        match (self.state.mode, event) {
            (NetworkMode::ConnectingSta, LinkEvent::LinkUp(address)) => {
                log::info!("Link up with address {}", address);
                self.address = Some(address);
                self.connect_deadline = None;
                self.state.retry_count = 0;
                self.set_mode(NetworkMode::StationConnected);
                if let Err(e) = self.ensure_service(LinkRole::Station) {
                    self.fault(now, e);
                    return;
                }
                self.fault_backoff = None;
                self.station_faults = 0;
            }
            (NetworkMode::StationConnected, LinkEvent::LinkUp(address)) => {
                // DHCP renewal with a new lease
                self.address = Some(address);
            }
            (NetworkMode::StationConnected, LinkEvent::LinkDown) => {
                log::warn!("Station link lost");
                self.address = None;
                self.stop_service();
                self.bump_retry();
                self.set_mode(NetworkMode::ConnectingSta);
                self.connect_deadline = now.checked_add(self.config.connect_timeout());
                if let Err(e) = self.link.connect() {
                    self.fault(now, e.into());
                }
            }
            (NetworkMode::ConnectingSta, LinkEvent::LinkDown) => {
                self.bump_retry();
                if self.state.retry_count > self.config.max_retries {
                    log::warn!(
                        "Gave up on station after {} retries",
                        self.config.max_retries
                    );
                    self.fall_back_to_ap(now);
                } else {
                    log::info!(
                        "Retrying station connection ({}/{})",
                        self.state.retry_count,
                        self.config.max_retries
                    );
                    if let Err(e) = self.link.connect() {
                        self.fault(now, e.into());
                    }
                }
            }
            (NetworkMode::ApFallback, LinkEvent::StationJoined(peer)) => {
                log::info!("Station {} joined, AID {}", format_peer(&peer), self.peers.len() + 1);
                self.peers.insert(peer);
                self.peers_empty_since = None;
            }
            (NetworkMode::ApFallback, LinkEvent::StationLeft(peer)) => {
                log::info!("Station {} left", format_peer(&peer));
                self.peers.remove(&peer);
                if self.peers.is_empty() {
                    self.peers_empty_since = Some(now);
                }
            }
            (mode, event) => {
                log::debug!("Ignoring {:?} in {}", event, mode);
            }
        }
    }

    /// Any state -> Reconfiguring -> ConnectingSTA
    fn reconfigure(&mut self, credentials: NetworkCredentials, now: Instant) {
        log::info!("Applying new credentials for SSID '{}'", credentials.ssid());
        self.set_mode(NetworkMode::Reconfiguring);
        self.stop_service();
        self.address = None;
        self.peers.clear();
        self.peers_empty_since = None;
        self.fault_retry_at = None;
        self.fault_backoff = None;
        self.station_faults = 0;

        if let Err(e) = self.link.disconnect() {
            log::warn!("Disconnect before reconfiguring failed: {}", e);
        }

        if let Err(e) = store::with_store(&self.store, |s| store::save_credentials(s, &credentials)) {
            log::error!("Failed to persist credentials: {}", e);
        }

        self.credentials = Some(credentials);
        self.state.retry_count = 0;
        if let Err(e) = self.begin_station(now) {
            self.fault(now, e);
        }
    }

    /// Startup decision, also used to recover from a fault. After
    /// `max_retries` consecutive station-side faults the AP is brought up
    /// instead; its idle probe tries the station again later.
    fn decide(&mut self, now: Instant) -> Result<(), DriverFailure> {
        if self.credentials.is_none() {
            log::info!("No station credentials, starting access point");
            return self.enter_ap(now);
        }
        if self.station_faults >= self.config.max_retries {
            log::warn!(
                "Station bring-up faulted {} times in a row, starting access point",
                self.station_faults
            );
            return self.enter_ap(now);
        }
        self.begin_station(now)
    }

    fn ensure_subscribed(&mut self) -> Result<(), DriverFailure> {
        if !self.subscribed {
            self.link.subscribe(self.inbox.sink.link_sink())?;
            self.subscribed = true;
        }
        Ok(())
    }

    fn begin_station(&mut self, now: Instant) -> Result<(), DriverFailure> {
        let Some(credentials) = self.credentials.clone() else {
            return self.enter_ap(now);
        };

        self.target = LinkRole::Station;
        self.stop_service();
        self.peers.clear();
        self.peers_empty_since = None;
        self.ap_entered_at = None;
        self.state.seconds_in_ap = 0;
        self.set_mode(NetworkMode::ConnectingSta);
        self.connect_deadline = now.checked_add(self.config.connect_timeout());

        log::info!("Connecting to SSID '{}'", credentials.ssid());
        self.ensure_subscribed()?;
        self.link.set_mode(LinkRole::Station)?;
        self.link.set_config(&LinkConfig::Station(credentials))?;
        self.link.connect()?;
        Ok(())
    }

    fn enter_ap(&mut self, now: Instant) -> Result<(), DriverFailure> {
        self.target = LinkRole::AccessPoint;
        self.stop_service();
        self.address = None;
        self.connect_deadline = None;
        self.peers.clear();
        self.peers_empty_since = Some(now);
        self.ap_entered_at = Some(now);
        self.state.seconds_in_ap = 0;

        let params = self.config.access_point();
        log::info!(
            "Starting AP '{}' on channel {} (max {} clients)",
            params.ssid,
            params.channel,
            params.max_clients
        );
        self.ensure_subscribed()?;
        self.link.set_mode(LinkRole::AccessPoint)?;
        self.link.set_config(&LinkConfig::AccessPoint(params))?;

        self.set_mode(NetworkMode::ApFallback);
        self.ensure_service(LinkRole::AccessPoint)?;
        self.fault_backoff = None;
        Ok(())
    }

    fn fall_back_to_ap(&mut self, now: Instant) {
        if let Err(e) = self.enter_ap(now) {
            self.fault(now, e);
        }
    }

    /// One station attempt from AP. The retry count is left saturated, so a
    /// single failure or the connect timeout returns to the AP.
    fn probe_station(&mut self, now: Instant) {
        self.state.retry_count = self.state.retry_count.max(self.config.max_retries);
        if let Err(e) = self.begin_station(now) {
            self.fault(now, e);
        }
    }

    fn ensure_service(&mut self, role: LinkRole) -> Result<(), DriverFailure> {
        if self.service.is_some() {
            return Ok(());
        }
        self.service = Some(self.services.start(role)?);
        Ok(())
    }

    fn stop_service(&mut self) {
        self.services.stop(self.service.take());
    }

    fn bump_retry(&mut self) {
        let ceiling = self.config.max_retries.saturating_add(1);
        self.state.retry_count = self.state.retry_count.saturating_add(1).min(ceiling);
    }

    fn fault(&mut self, now: Instant, error: DriverFailure) {
        let backoff = match self.fault_backoff {
            None => FAULT_BACKOFF_INITIAL,
            Some(previous) => previous.saturating_mul(2).min(self.config.fault_backoff_max()),
        };
        if self.target == LinkRole::Station {
            self.station_faults = self.station_faults.saturating_add(1);
        }
        log::error!(
            "Network driver failure in {}: {}; retrying in {:?}",
            self.state.mode,
            error,
            backoff
        );

        self.stop_service();
        self.address = None;
        self.connect_deadline = None;
        self.ap_entered_at = None;
        self.peers.clear();
        self.peers_empty_since = None;
        self.fault_backoff = Some(backoff);
        self.fault_retry_at = Some(now.checked_add(backoff).unwrap_or(now));
        self.set_mode(NetworkMode::Faulted);
    }

    fn shutdown(&mut self) {
        log::info!("Network supervisor shutting down");
        self.stop_service();
        if let Err(e) = self.link.disconnect() {
            log::warn!("Disconnect on shutdown failed: {}", e);
        }
        self.set_mode(NetworkMode::Idle);
    }

    fn set_mode(&mut self, mode: NetworkMode) {
        if self.state.mode != mode {
            log::info!("Network mode: {} -> {}", self.state.mode, mode);
            self.state.mode = mode;
        }
    }

    fn check_invariants(&self) {
        debug_assert_eq!(
            self.service.is_some(),
            self.state.mode.serves(),
            "service handle out of step with mode {}",
            self.state.mode
        );
        debug_assert_eq!(self.service, self.services.current());
        debug_assert!(self.state.retry_count <= self.config.max_retries.saturating_add(1));
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        match self.inbox.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}
