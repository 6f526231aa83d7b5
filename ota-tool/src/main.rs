use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::{Body, Client};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ota-tool")]
#[command(about = "Light node firmware and provisioning tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a firmware image and let the node restart into it
    Upload {
        /// Node address or hostname (e.g. my-esp32.local)
        host: String,
        /// Firmware binary
        #[arg(default_value = "target/xtensa-esp32s3-espidf/release/esp32-lightnode.bin")]
        firmware: PathBuf,
    },
    /// Show network, light and update status
    Status { host: String },
    /// Send new station credentials
    Wifi {
        host: String,
        #[arg(long)]
        ssid: String,
        #[arg(long, default_value = "")]
        psk: String,
    },
    /// Scan a /24 for nodes
    Scan {
        /// Network prefix to scan (e.g., 192.168.1)
        #[arg(short, long, default_value = "192.168.4")]
        subnet: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Upload { host, firmware } => upload_firmware(host, firmware),
        Commands::Status { host } => show_status(host),
        Commands::Wifi { host, ssid, psk } => send_credentials(host, ssid, psk),
        Commands::Scan { subnet } => scan_nodes(subnet),
    };

    if let Err(e) = result {
        println!("{} {:#}", "❌".red(), e);
        std::process::exit(1);
    }
}

fn client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

fn fetch_status(client: &Client, host: &str) -> Result<serde_json::Value> {
    let response = client
        .get(format!("http://{}/status_update", host))
        .send()
        .with_context(|| format!("{} unreachable", host))?;
    if !response.status().is_success() {
        bail!("status request failed: HTTP {}", response.status());
    }
    response.json().context("status is not valid JSON")
}

/// Counts bytes as reqwest pulls them from the image
struct ProgressReader<R> {
    inner: R,
    bar: ProgressBar,
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bar.inc(n as u64);
        Ok(n)
    }
}

fn upload_firmware(host: &str, firmware_path: &Path) -> Result<()> {
    let image = fs::read(firmware_path)
        .with_context(|| format!("failed to read firmware {}", firmware_path.display()))?;
    if image.is_empty() {
        bail!("firmware file is empty");
    }
    let size = image.len() as u64;
    let digest: String = Sha256::digest(&image).iter().map(|b| format!("{:02x}", b)).collect();

    println!("\n📤 {} {}", "Updating".cyan(), host);
    println!("   Firmware: {} bytes ({:.2} MB)", size, size as f64 / 1024.0 / 1024.0);
    println!("   SHA-256:  {}", digest);

    let bar = ProgressBar::new(size);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );

    let reader = ProgressReader {
        inner: Cursor::new(image),
        bar: bar.clone(),
    };
    let response = client(Duration::from_secs(120))?
        .post(format!("http://{}/ota", host))
        .header("Content-Type", "application/octet-stream")
        .header("X-Firmware-Sha256", &digest)
        .body(Body::sized(reader, size))
        .send();
    bar.finish_and_clear();

    let response = response.context("upload failed")?;
    if !response.status().is_success() {
        bail!("upload rejected: HTTP {}", response.status());
    }
    println!("   {} {}", "✅".green(), "Image committed, node is restarting".green());
    Ok(())
}

fn show_status(host: &str) -> Result<()> {
    let status = fetch_status(&client(Duration::from_secs(5))?, host)?;
    let network = &status["network"];

    println!("{} {}", "Node".bold().blue(), host);
    println!("  version   {}", status["version"].as_str().unwrap_or("?"));
    println!(
        "  network   {} (ssid {}, address {}, retries {})",
        network["mode"].as_str().unwrap_or("?").yellow(),
        network["ssid"].as_str().unwrap_or("-"),
        network["address"].as_str().unwrap_or("-"),
        network["retries"]
    );
    if network["mode"] == "ap_fallback" {
        println!("  ap        {} s up, {} peer(s)", network["ap_seconds"], network["peers"]);
    }
    println!(
        "  update    {} ({} bytes)",
        status["update"]["status"].as_str().unwrap_or("?"),
        status["update"]["bytes_written"]
    );
    if let Some(uri) = status["mqtt_uri"].as_str() {
        println!("  broker    {}", uri);
    }
    for (i, light) in status["lights"].as_array().into_iter().flatten().enumerate() {
        println!(
            "  light {}   {:<12} level {:>3} {}",
            i,
            light["name"].as_str().unwrap_or(""),
            light["level"],
            if light["enabled"].as_bool().unwrap_or(false) { "on".green() } else { "off".dimmed() }
        );
    }
    Ok(())
}

fn send_credentials(host: &str, ssid: &str, psk: &str) -> Result<()> {
    let body = serde_json::json!({ "ssid": ssid, "psk": psk });
    let response = client(Duration::from_secs(10))?
        .post(format!("http://{}/", host))
        .body(body.to_string())
        .send()
        .with_context(|| format!("{} unreachable", host))?;
    let status = response.status();
    let text = response.text().unwrap_or_default();
    if !status.is_success() {
        bail!("credentials rejected: HTTP {} {}", status, text);
    }
    println!("{} {}", "✅".green(), text);
    println!("   The node leaves its current network and joins '{}'", ssid);
    Ok(())
}

fn scan_nodes(subnet: &str) -> Result<()> {
    println!("🔍 {} {}.0/24...", "Scanning network".cyan(), subnet);
    let client = client(Duration::from_millis(500))?;

    let handles: Vec<_> = (1..255)
        .map(|i| {
            let host = format!("{}.{}", subnet, i);
            let client = client.clone();
            std::thread::spawn(move || {
                fetch_status(&client, &host).ok().map(|status| (host, status))
            })
        })
        .collect();

    let mut found = 0;
    for handle in handles {
        if let Ok(Some((host, status))) = handle.join() {
            found += 1;
            println!(
                "  ✓ {} {} [{}]",
                host.green(),
                status["version"].as_str().unwrap_or("unknown"),
                status["network"]["mode"].as_str().unwrap_or("?")
            );
        }
    }

    if found == 0 {
        println!("{}", "❌ No nodes found".red());
    } else {
        println!("\n📱 Found {} node(s)", found);
    }
    Ok(())
}
