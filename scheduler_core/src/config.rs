//! The immutable configuration every other component reads. Built once, from
//! validated CLI flags (see the `scheduler` binary crate's `Args`), and
//! never re-parsed downstream — an explicit builder in place of a
//! process-wide singleton.
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addrs: Vec<IpAddr>,
    pub ext_addrs: Vec<IpAddr>,
    pub node_specs: Vec<String>,

    pub scheduler_port: u16,
    pub node_port: u16,
    pub command_port: u16,

    pub node_secret: Vec<u8>,
    pub cluster_secret: Vec<u8>,

    pub pulse_interval: Duration,
    pub ping_interval: Duration,
    pub zombie_interval: Duration,
    pub msg_timeout: Duration,

    pub dest_path_prefix: PathBuf,
    pub max_file_size: u64,
    pub clean_on_start: bool,
    pub httpd: bool,
    pub debug: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("pulse_interval must be within 1..=1000 seconds, got {0:?}")]
    PulseIntervalOutOfRange(Duration),
    #[error("ping_interval must be within 1..=1000 seconds, got {0:?}")]
    PingIntervalOutOfRange(Duration),
    #[error("zombie_interval must be at least 1 minute, got {0:?}")]
    ZombieIntervalTooShort(Duration),
    #[error("invalid --max_file_size suffix in {0:?}")]
    BadFileSizeSuffix(String),
}

impl Config {
    /// Auto-bounds `pulse_interval <= zombie_interval / 5`.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.pulse_interval.as_secs_f64() < 1.0
            || self.pulse_interval.as_secs_f64() > 1000.0
        {
            return Err(ConfigError::PulseIntervalOutOfRange(
                self.pulse_interval,
            ));
        }
        if self.ping_interval.as_secs_f64() < 1.0
            || self.ping_interval.as_secs_f64() > 1000.0
        {
            return Err(ConfigError::PingIntervalOutOfRange(self.ping_interval));
        }
        if self.zombie_interval < Duration::from_secs(60) {
            return Err(ConfigError::ZombieIntervalTooShort(
                self.zombie_interval,
            ));
        }
        let bound = self.zombie_interval / 5;
        if self.pulse_interval > bound {
            self.pulse_interval = bound;
        }
        Ok(self)
    }

    /// The single period the timer service (C8) ticks at:
    /// `min(pulse_interval, ping_interval, zombie_interval)`.
    pub fn timer_tick(&self) -> Duration {
        self.pulse_interval
            .min(self.ping_interval)
            .min(self.zombie_interval)
    }

    /// A node is declared dead once `5 * pulse_interval` has elapsed since
    /// its last pulse.
    pub fn pulse_timeout(&self) -> Duration {
        self.pulse_interval * 5
    }
}

/// Parses a `--max_file_size` value with an optional `k|m|g|t` suffix
/// (case-insensitive) into a byte count.
pub fn parse_file_size(raw: &str) -> Result<u64, ConfigError> {
    let raw = raw.trim();
    let (digits, mult) = match raw.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&raw[..raw.len() - 1], 1024u64),
        Some(c) if c.eq_ignore_ascii_case(&'m') => {
            (&raw[..raw.len() - 1], 1024 * 1024)
        }
        Some(c) if c.eq_ignore_ascii_case(&'g') => {
            (&raw[..raw.len() - 1], 1024 * 1024 * 1024)
        }
        Some(c) if c.eq_ignore_ascii_case(&'t') => {
            (&raw[..raw.len() - 1], 1024 * 1024 * 1024 * 1024)
        }
        _ => (raw, 1),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| ConfigError::BadFileSizeSuffix(raw.to_string()))?;
    Ok(base * mult)
}
