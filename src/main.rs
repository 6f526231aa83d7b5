#[cfg(target_os = "espidf")]
use std::sync::{Arc, Mutex};
#[cfg(target_os = "espidf")]
use std::time::Duration;

#[cfg(target_os = "espidf")]
use anyhow::{Context, Result};
#[cfg(target_os = "espidf")]
use esp_idf_hal::prelude::Peripherals;
#[cfg(target_os = "espidf")]
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};

#[cfg(target_os = "espidf")]
use lightnode::{
    config,
    http::{AppContext, BasicAuth},
    lights::LightBank,
    logging,
    network::{supervisor, Supervisor},
    ota::{boot_guard::BootGuard, restart::Restarter, session::UpdateService},
    platform::{
        http::HttpServiceFactory, ledc::LedcDimmer, mdns, nvs::NvsStore, ota::EspSlots,
        restart::EspRestarter, wifi::WifiLink,
    },
    store, version,
};

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();
    logging::init_logger().map_err(|e| anyhow::anyhow!("logger: {}", e))?;

    log::info!("Light node {} starting", version::full_version());
    log::info!("Free heap: {} bytes", unsafe { esp_idf_sys::esp_get_free_heap_size() });

    let peripherals = Peripherals::take().context("peripherals already taken")?;
    let sys_loop = EspSystemEventLoop::take().context("system event loop")?;
    let nvs = EspDefaultNvsPartition::take().context("default NVS partition")?;

    let store = store::shared(NvsStore::new(nvs.clone()).context("opening settings namespace")?);
    if let Err(e) = config::seed_credentials(&store, config::build_time_credentials().as_ref()) {
        log::warn!("Could not seed build-time credentials: {:?}", e);
    }
    let config = Arc::new(config::load_or_default(&store));

    // Confirm or roll back a freshly updated image in the background
    let slots = Arc::new(Mutex::new(EspSlots::new()));
    let (guard, rollback) = BootGuard::new(slots.clone(), config.boot_grace());
    guard.spawn();

    let stored_lights = store::with_store(&store, |s| store::load_lights(s)).unwrap_or_else(|e| {
        log::warn!("Failed to load light settings: {}, using defaults", e);
        Default::default()
    });
    let dimmer = match LedcDimmer::new(peripherals.ledc, peripherals.pins.gpio7, peripherals.pins.gpio6) {
        Ok(dimmer) => dimmer,
        Err(e) => {
            rollback.fire(&format!("PWM setup failed: {}", e));
            return Err(e);
        }
    };
    let lights = Arc::new(Mutex::new(LightBank::new(Box::new(dimmer), stored_lights)));

    let restarter: Arc<dyn Restarter> = Arc::new(EspRestarter);
    let updates = UpdateService::new(
        slots,
        restarter,
        Duration::from_millis(config.ota.restart_delay_ms),
    );

    let (handle, inbox) = supervisor::channel();
    let ctx = AppContext {
        supervisor: handle,
        lights,
        store: store.clone(),
        updates,
        auth: BasicAuth::from_config(&config.ota),
        config: config.clone(),
    };

    let link = match WifiLink::new(peripherals.modem, sys_loop, nvs, &config.identity.hostname)
        .context("WiFi driver init")
    {
        Ok(link) => link,
        Err(e) => {
            rollback.fire(&format!("{:#}", e));
            return Err(e);
        }
    };

    // Advertising is optional; the node stays reachable by address
    let _mdns = mdns::advertise(&config.identity.hostname)
        .map_err(|e| log::warn!("mDNS unavailable: {:?}", e))
        .ok();

    let supervisor = Supervisor::new(
        (*config).clone(),
        link,
        HttpServiceFactory::new(ctx),
        store,
        inbox,
    );
    supervisor.run();

    log::warn!("Network supervisor stopped");
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    let _ = lightnode::logging::init_logger();
    log::error!(
        "{} is device firmware; build it for an ESP32 target. Run `cargo test` for the host suite.",
        lightnode::version::full_version()
    );
    anyhow::bail!("unsupported target")
}
