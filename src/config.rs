use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// How the bot authenticates against the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum Credentials {
    /// Bot token (bearer)
    Token(String),
    /// Account email/password pair
    Account { email: String, password: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub credentials: Credentials,

    // Audio
    pub default_volume: f32,
    pub max_queue_size: usize,

    // Runtime
    pub worker_threads: usize,
    #[serde(with = "humantime_serde")]
    pub reconnect_cooldown: Duration,
    #[serde(with = "humantime_serde")]
    pub delete_after: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,

    // Decode pipeline
    pub work_dir: PathBuf,
    pub ytdlp_bin: String,
    pub ffmpeg_bin: String,

    // Metadata cache
    pub cache_size: usize,
    #[serde(with = "humantime_serde")]
    pub metadata_ttl: Duration,

    // Output
    pub message_limit: usize,
}

impl Config {
    /// Loads `.env`, then environment variables.
    ///
    /// The token can also be given as the first command line argument, which
    /// wins over `DISCORD_TOKEN`. Fails when no credential is available.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let cli_token = std::env::args()
            .skip(1)
            .find(|arg| !arg.starts_with("--"));

        let credentials = match cli_token.or_else(|| std::env::var("DISCORD_TOKEN").ok()) {
            Some(token) if !token.trim().is_empty() => Credentials::Token(token.trim().to_string()),
            _ => match (std::env::var("DISCORD_EMAIL"), std::env::var("DISCORD_PASSWORD")) {
                (Ok(email), Ok(password)) => Credentials::Account { email, password },
                _ => anyhow::bail!(
                    "Please enter token as argument or set DISCORD_TOKEN"
                ),
            },
        };

        let defaults = Self::default();

        let config = Self {
            credentials,

            default_volume: std::env::var("DEFAULT_VOLUME")
                .unwrap_or_else(|_| defaults.default_volume.to_string())
                .parse()
                .context("DEFAULT_VOLUME")?,
            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| defaults.max_queue_size.to_string())
                .parse()
                .context("MAX_QUEUE_SIZE")?,

            worker_threads: match std::env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => val.parse().context("WORKER_THREADS")?,
                _ => num_cpus::get(),
            },
            reconnect_cooldown: env_duration("RECONNECT_COOLDOWN", defaults.reconnect_cooldown)?,
            delete_after: env_duration("DELETE_AFTER", defaults.delete_after)?,
            probe_timeout: env_duration("PROBE_TIMEOUT", defaults.probe_timeout)?,
            idle_timeout: env_duration("IDLE_TIMEOUT", defaults.idle_timeout)?,
            maintenance_interval: env_duration(
                "MAINTENANCE_INTERVAL",
                defaults.maintenance_interval,
            )?,

            work_dir: std::env::var("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            ytdlp_bin: std::env::var("YTDLP_BIN").unwrap_or(defaults.ytdlp_bin),
            ffmpeg_bin: std::env::var("FFMPEG_BIN").unwrap_or(defaults.ffmpeg_bin),

            cache_size: std::env::var("CACHE_SIZE")
                .unwrap_or_else(|_| defaults.cache_size.to_string())
                .parse()
                .context("CACHE_SIZE")?,
            metadata_ttl: env_duration("METADATA_TTL", defaults.metadata_ttl)?,

            message_limit: std::env::var("MESSAGE_LIMIT")
                .unwrap_or_else(|_| defaults.message_limit.to_string())
                .parse()
                .context("MESSAGE_LIMIT")?,
        };

        // Sidecar files land here
        std::fs::create_dir_all(&config.work_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0.0 and 1.0
    /// - Queue, cache and message limits must be greater than 0
    /// - The reconnect cooldown must be at least one second (gateway login
    ///   rate limit)
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_volume) {
            anyhow::bail!(
                "Default volume must be between 0.0 and 1.0, got: {}",
                self.default_volume
            );
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.cache_size == 0 {
            anyhow::bail!("Cache size must be greater than 0");
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        if self.message_limit < 16 {
            anyhow::bail!("Message limit too low, minimum 16, got: {}", self.message_limit);
        }

        if self.reconnect_cooldown < Duration::from_secs(1) {
            anyhow::bail!(
                "Reconnect cooldown must be at least 1s, got: {}",
                humantime::format_duration(self.reconnect_cooldown)
            );
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Credentials are never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Auth: {}\n  \
            Audio: {}% vol, {} max queue\n  \
            Runtime: {} workers, {} reconnect cooldown, {} idle eviction\n  \
            Decode: {} + {} in {}",
            match self.credentials {
                Credentials::Token(_) => "token",
                Credentials::Account { .. } => "account",
            },
            (self.default_volume * 100.0).round() as u32,
            self.max_queue_size,
            self.worker_threads,
            humantime::format_duration(self.reconnect_cooldown),
            humantime::format_duration(self.idle_timeout),
            self.ytdlp_bin,
            self.ffmpeg_bin,
            self.work_dir.display(),
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            credentials: Credentials::Token(String::new()),

            default_volume: 0.2,
            max_queue_size: 1000,

            worker_threads: num_cpus::get(),
            reconnect_cooldown: Duration::from_secs(5), // 1 login per 5s gateway limit
            delete_after: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30 * 60),
            maintenance_interval: Duration::from_secs(5 * 60),

            work_dir: "./cache".into(),
            ytdlp_bin: if cfg!(windows) { "yt-dlp.exe" } else { "yt-dlp" }.to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),

            cache_size: 100,
            metadata_ttl: Duration::from_secs(3600),

            message_limit: 2000,
        }
    }
}

fn env_duration(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => humantime::parse_duration(val.trim())
            .with_context(|| format!("{key} must be a duration like \"5s\" or \"30m\"")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut config = Config::default();
        config.credentials = Credentials::Token("abc".into());
        assert!(config.validate().is_ok());
        assert_eq!(config.default_volume, 0.2);
        assert_eq!(config.reconnect_cooldown, Duration::from_secs(5));
    }

    #[test]
    fn rejects_out_of_range_volume() {
        let config = Config {
            default_volume: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn summary_hides_token() {
        let config = Config {
            credentials: Credentials::Token("super-secret".into()),
            ..Config::default()
        };
        let summary = config.summary();
        assert!(!summary.contains("super-secret"));
        assert!(summary.contains("20% vol"));
    }

    #[test]
    fn durations_round_trip_through_serde() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"5s\""));
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.idle_timeout, config.idle_timeout);
    }
}
