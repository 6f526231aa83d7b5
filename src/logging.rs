use log::{Level, LevelFilter, Metadata, Record};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static BOOT_TIME: OnceLock<Instant> = OnceLock::new();

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const BRIGHT_GREEN: &str = "\x1b[92m";
    pub const BRIGHT_BLUE: &str = "\x1b[94m";
    pub const GRAY: &str = "\x1b[90m";
}

/// Serial console logger: colored, timestamped lines
struct ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let elapsed = BOOT_TIME.get_or_init(Instant::now).elapsed();
        let (color, level_char) = level_style(record.level());
        let module = short_module(record.module_path().unwrap_or("unknown"));

        println!(
            "{}{} [{}] {:>12} | {}{}",
            color,
            format_uptime(elapsed),
            level_char,
            module,
            record.args(),
            colors::RESET
        );
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

fn level_style(level: Level) -> (&'static str, char) {
    match level {
        Level::Error => (colors::BRIGHT_RED, 'E'),
        Level::Warn => (colors::BRIGHT_YELLOW, 'W'),
        Level::Info => (colors::BRIGHT_GREEN, 'I'),
        Level::Debug => (colors::BRIGHT_BLUE, 'D'),
        Level::Trace => (colors::GRAY, 'T'),
    }
}

/// Last path segment, clipped to the column width
fn short_module(path: &str) -> &str {
    let module = path.rsplit("::").next().unwrap_or(path);
    match module.char_indices().nth(12) {
        Some((end, _)) => &module[..end],
        None => module,
    }
}

/// Compact uptime: `  4.250s`, ` 3m07s`, ` 2h15m`
fn format_uptime(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    if seconds < 60 {
        format!("{:>3}.{:03}s", seconds, elapsed.subsec_millis())
    } else if seconds < 3600 {
        format!("{:>2}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{:>2}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Installs the console logger, max level Debug
pub fn init_logger() -> Result<(), log::SetLoggerError> {
    let _ = BOOT_TIME.set(Instant::now());
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Debug);

    println!("{}┌─────────────────────────────────────────┐{}", colors::BRIGHT_GREEN, colors::RESET);
    println!(
        "{}│   Light Node {:<27}│{}",
        colors::BRIGHT_GREEN,
        crate::version::FIRMWARE_VERSION,
        colors::RESET
    );
    println!("{}└─────────────────────────────────────────┘{}", colors::BRIGHT_GREEN, colors::RESET);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formats() {
        assert_eq!(format_uptime(Duration::from_millis(4250)), "  4.250s");
        assert_eq!(format_uptime(Duration::from_secs(187)), " 3m07s");
        assert_eq!(format_uptime(Duration::from_secs(2 * 3600 + 15 * 60)), " 2h15m");
    }

    #[test]
    fn module_names_are_clipped() {
        assert_eq!(short_module("lightnode::network::supervisor"), "supervisor");
        assert_eq!(short_module("lightnode::ota::boot_guard_extended"), "boot_guard_e");
        assert_eq!(short_module("main"), "main");
    }
}
