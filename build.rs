use std::fs;
use std::path::Path;

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF; host builds (tests, tooling) skip it
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }

    println!("cargo:rerun-if-changed=wifi_config.h");

    // Optional build-time station credentials. They only seed the store on a
    // device that has never been provisioned.
    let wifi_config_path = "wifi_config.h";
    if Path::new(wifi_config_path).exists() {
        let contents = fs::read_to_string(wifi_config_path)?;

        let ssid = define_value(&contents, "WIFI_SSID").unwrap_or_default();
        let password = define_value(&contents, "WIFI_PASSWORD").unwrap_or_default();

        println!("cargo:rustc-env=WIFI_SSID={}", ssid);
        println!("cargo:rustc-env=WIFI_PASSWORD={}", password);
    } else {
        // Empty defaults: the device boots straight into its fallback AP
        println!("cargo:rustc-env=WIFI_SSID=");
        println!("cargo:rustc-env=WIFI_PASSWORD=");
    }

    Ok(())
}

fn define_value(contents: &str, name: &str) -> Option<String> {
    let marker = format!("#define {}", name);
    contents
        .lines()
        .find(|l| l.trim_start().starts_with(&marker))
        .and_then(|l| l.split('"').nth(1))
        .map(str::to_string)
}
