//! Shared fixture: the whole node wired to in-memory collaborators.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lightnode::config::SupervisorConfig;
use lightnode::http::{AppContext, BasicAuth};
use lightnode::lights::{LightBank, LightInfo, LIGHT_COUNT};
use lightnode::network::credentials::NetworkCredentials;
use lightnode::network::supervisor::{self, Supervisor, SupervisorHandle};
use lightnode::ota::restart::Restarter;
use lightnode::ota::session::UpdateService;
use lightnode::sim::{SimDimmer, SimLink, SimRestarter, SimServiceFactory, SimSlots};
use lightnode::store::{self, MemoryStore, SharedStore};

pub const RESTART_DELAY: Duration = Duration::from_millis(20);

pub struct Node {
    pub supervisor: Supervisor<SimLink, SimServiceFactory>,
    pub handle: SupervisorHandle,
    pub link: SimLink,
    pub factory: SimServiceFactory,
    pub store: SharedStore,
    pub slots: SimSlots,
    pub dimmer: SimDimmer,
    pub restarter: SimRestarter,
    pub ctx: AppContext<SimSlots>,
    pub t0: Instant,
}

impl Node {
    pub fn boot(credentials: Option<(&str, &str)>) -> Self {
        Self::boot_with(SupervisorConfig::default(), credentials)
    }

    pub fn boot_with(config: SupervisorConfig, credentials: Option<(&str, &str)>) -> Self {
        let mut backing = MemoryStore::new();
        if let Some((ssid, psk)) = credentials {
            let creds = NetworkCredentials::new(ssid, psk).unwrap();
            store::save_credentials(&mut backing, &creds).unwrap();
        }
        let store = store::shared(backing);

        let link = SimLink::new();
        let factory = SimServiceFactory::new();
        let slots = SimSlots::new();
        let dimmer = SimDimmer::new(2);
        let restarter = SimRestarter::new();

        let stored: [LightInfo; LIGHT_COUNT] =
            store::with_store(&store, |s| store::load_lights(s)).unwrap();
        let lights = Arc::new(Mutex::new(LightBank::new(Box::new(dimmer.clone()), stored)));
        let shared_restarter: Arc<dyn Restarter> = Arc::new(restarter.clone());
        let updates = UpdateService::new(
            Arc::new(Mutex::new(slots.clone())),
            shared_restarter,
            RESTART_DELAY,
        );

        let (handle, inbox) = supervisor::channel();
        let config = Arc::new(config);
        let ctx = AppContext {
            supervisor: handle.clone(),
            lights,
            store: store.clone(),
            updates,
            auth: BasicAuth::from_config(&config.ota),
            config: config.clone(),
        };
        let supervisor = Supervisor::new(
            (*config).clone(),
            link.clone(),
            factory.clone(),
            store.clone(),
            inbox,
        );

        Self {
            supervisor,
            handle,
            link,
            factory,
            store,
            slots,
            dimmer,
            restarter,
            ctx,
            t0: Instant::now(),
        }
    }

    pub fn at(&self, secs: u64) -> Instant {
        self.t0 + Duration::from_secs(secs)
    }

    pub fn stored_credentials(&self) -> Option<NetworkCredentials> {
        store::with_store(&self.store, |s| store::load_credentials(s)).unwrap()
    }
}
