use anyhow::Result;
use esp_idf_svc::mdns::EspMdns;

/// Advertises `<hostname>.local` and the web UI. Keep the returned handle
/// alive for as long as the responder should run.
pub fn advertise(hostname: &str) -> Result<EspMdns> {
    let mut mdns = EspMdns::take()?;
    mdns.set_hostname(hostname)?;
    mdns.set_instance_name(hostname)?;
    mdns.add_service(None, "_http", "_tcp", 80, &[])?;
    log::info!("mDNS: http://{}.local/", hostname);
    Ok(mdns)
}
