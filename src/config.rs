//! Configuration: environment-variable defaults merged with CLI overrides,
//! validated once at startup into an immutable [`Config`].

use std::env;
use std::path::PathBuf;
use thiserror::Error;
use tokio::time::Duration;

use crate::utils::parse_duration_string;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("mTLS configuration incomplete: both CLIENT_CERT_PATH and CLIENT_KEY_PATH must be set together, or neither")]
    IncompleteMtls,

    #[error("Mode '{mode}' requires: {required}")]
    MissingModeParams { mode: String, required: String },

    #[error("Invalid duration format for {var}: {message}")]
    InvalidDuration { var: String, message: String },

    #[error("URL validation failed: {0}")]
    InvalidUrl(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// How a virtual user identity is chosen for a journey invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RandomUserMode {
    /// Use the configured fixed `uid`.
    Off,
    /// Generate a fresh random uid for every journey.
    PerRequest,
    /// Draw uniformly from a pre-generated pool of `n` uids.
    Pool(usize),
}

/// Which journey script a worker executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JourneyVariant {
    Standard,
    StandardPlusStaticAssets,
}

/// The offered-load mode: a synthetic wave, or a replayed trace.
#[derive(Debug, Clone)]
pub enum LoadSource {
    Wave { rps: usize, duration_secs: u64 },
    Replay { file: PathBuf, speed: f64 },
}

/// Immutable run configuration, merged from environment variables and CLI
/// flags (CLI wins) and validated once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub target_url: String,
    pub series: String,
    pub puzzle_id: String,
    pub state_len: usize,
    pub request_timeout: Duration,
    pub source: LoadSource,
    pub parallel_override: Option<usize>,
    pub uid: Option<String>,
    pub random_user_mode: RandomUserMode,
    pub journey_variant: JourneyVariant,
    pub title: String,
    pub output: Option<PathBuf>,
    pub dry_run: bool,
    pub save_sessions: Option<PathBuf>,
    pub load_sessions: Option<PathBuf>,
    pub emit_html: bool,
    pub verbosity: u8,
    pub skip_tls_verify: bool,
    pub resolve_target_addr: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub custom_headers: Option<String>,
    pub max_concurrent_requests: usize,
    pub max_per_host: usize,
    pub metrics_port: Option<u16>,
}

/// CLI-shaped overrides. Every field is optional (or false/0); populated
/// by `clap` in `main` and merged over the environment-derived defaults.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub rps: Option<usize>,
    pub duration: Option<u64>,
    pub parallel: Option<usize>,
    pub uid: Option<String>,
    pub random_uid: bool,
    pub uid_pool_size: Option<usize>,
    pub title: Option<String>,
    pub output: Option<PathBuf>,
    pub replay: Option<PathBuf>,
    pub speed: Option<f64>,
    pub dry_run: bool,
    pub save_sessions: Option<PathBuf>,
    pub load_sessions: Option<PathBuf>,
    pub html: bool,
    pub verbosity: u8,
}

fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.into()))
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables, then apply CLI
    /// overrides (CLI wins), then validate the merged result.
    pub fn load(cli: &CliOverrides) -> Result<Self, ConfigError> {
        let target_url = env_required("TARGET_URL")?;
        let series = env::var("SERIES").unwrap_or_else(|_| "default".to_string());
        let puzzle_id = env_required("PUZZLE_ID")?;
        let state_len: usize = env_parse_or("STATE_LEN", 185)?;

        let timeout_secs: u64 = env_parse_or("REQUEST_TIMEOUT_SECS", 30)?;
        let request_timeout = Duration::from_secs(timeout_secs);

        let env_rps: usize = env_parse_or("RPS", 1)?;
        let env_duration: u64 = env_parse_or("DURATION_SECS", 10)?;

        let source = if let Some(replay_path) = cli
            .replay
            .clone()
            .or_else(|| env::var("REPLAY_FILE").ok().map(PathBuf::from))
        {
            let speed = match cli.speed {
                Some(s) => s,
                None => env_parse_or("SPEED_FACTOR", 1.0f64)?,
            };
            if speed <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    var: "SPEED_FACTOR".into(),
                    message: "speed factor must be positive".into(),
                });
            }
            LoadSource::Replay {
                file: replay_path,
                speed,
            }
        } else {
            LoadSource::Wave {
                rps: cli.rps.unwrap_or(env_rps),
                duration_secs: cli.duration.unwrap_or(env_duration),
            }
        };

        let uid = cli.uid.clone().or_else(|| env::var("UID").ok());
        let random_user_mode = if cli.random_uid {
            RandomUserMode::PerRequest
        } else if let Some(n) = cli.uid_pool_size {
            RandomUserMode::Pool(n)
        } else {
            match env::var("RANDOM_UID_MODE").as_deref() {
                Ok("per-request") => RandomUserMode::PerRequest,
                Ok(pool_spec) if pool_spec.starts_with("pool:") => {
                    let n: usize = pool_spec[5..].parse().map_err(|_| ConfigError::InvalidValue {
                        var: "RANDOM_UID_MODE".into(),
                        message: format!("invalid pool size in '{}'", pool_spec),
                    })?;
                    RandomUserMode::Pool(n)
                }
                _ => RandomUserMode::Off,
            }
        };

        if random_user_mode == RandomUserMode::Off && uid.is_none() {
            return Err(ConfigError::MissingModeParams {
                mode: "RANDOM_UID_MODE=off".into(),
                required: "UID (or --uid / --random-uid / --uid-pool-size)".into(),
            });
        }

        let journey_variant = match env::var("JOURNEY_VARIANT").as_deref() {
            Ok("standard-plus-static-assets") => JourneyVariant::StandardPlusStaticAssets,
            _ => JourneyVariant::Standard,
        };

        let title = cli
            .title
            .clone()
            .or_else(|| env::var("TITLE").ok())
            .unwrap_or_else(|| "load test".to_string());

        let output = cli
            .output
            .clone()
            .or_else(|| env::var("OUTPUT").ok().map(PathBuf::from));
        let dry_run = cli.dry_run || env_bool("DRY_RUN", false);
        let save_sessions = cli
            .save_sessions
            .clone()
            .or_else(|| env::var("SAVE_SESSIONS").ok().map(PathBuf::from));
        let load_sessions = cli
            .load_sessions
            .clone()
            .or_else(|| env::var("LOAD_SESSIONS").ok().map(PathBuf::from));
        let emit_html = cli.html || env_bool("HTML", false);
        let verbosity = cli.verbosity.max(env_parse_or::<u8>("VERBOSITY", 0)?);

        let skip_tls_verify = env_bool("SKIP_TLS_VERIFY", false);
        let resolve_target_addr = env::var("RESOLVE_TARGET_ADDR").ok();
        let client_cert_path = env::var("CLIENT_CERT_PATH").ok();
        let client_key_path = env::var("CLIENT_KEY_PATH").ok();
        let custom_headers = env::var("CUSTOM_HEADERS").ok();

        let max_concurrent_requests: usize = env_parse_or("MAX_CONCURRENT_REQUESTS", 200)?;
        let max_per_host: usize = env_parse_or("MAX_PER_HOST", 100)?;
        let metrics_port: Option<u16> = match env::var("METRICS_PORT") {
            Ok(v) => Some(v.parse().map_err(|_| ConfigError::InvalidValue {
                var: "METRICS_PORT".into(),
                message: format!("'{}' is not a valid port", v),
            })?),
            Err(_) => None,
        };

        let parallel_override = cli
            .parallel
            .or_else(|| env::var("PARALLEL").ok().and_then(|v| v.parse().ok()));

        let config = Config {
            target_url,
            series,
            puzzle_id,
            state_len,
            request_timeout,
            source,
            parallel_override,
            uid,
            random_user_mode,
            journey_variant,
            title,
            output,
            dry_run,
            save_sessions,
            load_sessions,
            emit_html,
            verbosity,
            skip_tls_verify,
            resolve_target_addr,
            client_cert_path,
            client_key_path,
            custom_headers,
            max_concurrent_requests,
            max_per_host,
            metrics_port,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.target_url.starts_with("http://") && !self.target_url.starts_with("https://") {
            return Err(ConfigError::InvalidUrl(format!(
                "target_url '{}' must start with http:// or https://",
                self.target_url
            )));
        }

        if self.state_len == 0 {
            return Err(ConfigError::InvalidValue {
                var: "STATE_LEN".into(),
                message: "state vector length must be greater than zero".into(),
            });
        }

        match &self.source {
            LoadSource::Wave { rps, duration_secs } => {
                if *rps == 0 || *duration_secs == 0 {
                    return Err(ConfigError::MissingModeParams {
                        mode: "wave".into(),
                        required: "rps > 0 and duration_secs > 0".into(),
                    });
                }
            }
            LoadSource::Replay { speed, .. } => {
                if *speed <= 0.0 {
                    return Err(ConfigError::InvalidValue {
                        var: "SPEED_FACTOR".into(),
                        message: "must be positive".into(),
                    });
                }
            }
        }

        match (&self.client_cert_path, &self.client_key_path) {
            (Some(_), None) | (None, Some(_)) => return Err(ConfigError::IncompleteMtls),
            _ => {}
        }

        Ok(())
    }

    /// Re-parse a freestanding duration string (`"10m"`, `"2h"`), kept for
    /// any operator-facing knob expressed the same way elsewhere in the
    /// stack (e.g. a future safety-margin override).
    pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
        parse_duration_string(s).map_err(|message| ConfigError::InvalidDuration {
            var: s.to_string(),
            message,
        })
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        Config {
            target_url: "http://localhost:1234".to_string(),
            series: "test".to_string(),
            puzzle_id: "d4725144".to_string(),
            state_len: 10,
            request_timeout: Duration::from_secs(30),
            source: LoadSource::Wave {
                rps: 1,
                duration_secs: 1,
            },
            parallel_override: None,
            uid: Some("vansh".to_string()),
            random_user_mode: RandomUserMode::Off,
            journey_variant: JourneyVariant::Standard,
            title: "test".to_string(),
            output: None,
            dry_run: false,
            save_sessions: None,
            load_sessions: None,
            emit_html: false,
            verbosity: 0,
            skip_tls_verify: false,
            resolve_target_addr: None,
            client_cert_path: None,
            client_key_path: None,
            custom_headers: None,
            max_concurrent_requests: 200,
            max_per_host: 100,
            metrics_port: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        for var in [
            "TARGET_URL",
            "SERIES",
            "PUZZLE_ID",
            "STATE_LEN",
            "REQUEST_TIMEOUT_SECS",
            "RPS",
            "DURATION_SECS",
            "SPEED_FACTOR",
            "REPLAY_FILE",
            "UID",
            "RANDOM_UID_MODE",
            "JOURNEY_VARIANT",
            "TITLE",
            "OUTPUT",
            "DRY_RUN",
            "SAVE_SESSIONS",
            "LOAD_SESSIONS",
            "HTML",
            "VERBOSITY",
            "SKIP_TLS_VERIFY",
            "RESOLVE_TARGET_ADDR",
            "CLIENT_CERT_PATH",
            "CLIENT_KEY_PATH",
            "CUSTOM_HEADERS",
            "MAX_CONCURRENT_REQUESTS",
            "MAX_PER_HOST",
            "METRICS_PORT",
            "PARALLEL",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn missing_target_url_is_fatal() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();
        let result = Config::load(&CliOverrides::default());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "TARGET_URL"));
    }

    #[test]
    #[serial]
    fn defaults_to_wave_mode() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();
        env::set_var("TARGET_URL", "http://localhost:8080");
        env::set_var("PUZZLE_ID", "d4725144");
        env::set_var("UID", "vansh");

        let config = Config::load(&CliOverrides::default()).unwrap();
        assert!(matches!(config.source, LoadSource::Wave { .. }));
        assert_eq!(config.state_len, 185);
    }

    #[test]
    #[serial]
    fn cli_replay_overrides_wave() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();
        env::set_var("TARGET_URL", "http://localhost:8080");
        env::set_var("PUZZLE_ID", "d4725144");
        env::set_var("UID", "vansh");

        let cli = CliOverrides {
            replay: Some(PathBuf::from("trace.jsonl")),
            speed: Some(2.0),
            ..Default::default()
        };
        let config = Config::load(&cli).unwrap();
        match config.source {
            LoadSource::Replay { speed, .. } => assert_eq!(speed, 2.0),
            _ => panic!("expected replay source"),
        }
    }

    #[test]
    #[serial]
    fn rejects_invalid_url_scheme() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();
        env::set_var("TARGET_URL", "ftp://localhost");
        env::set_var("PUZZLE_ID", "d4725144");
        env::set_var("UID", "vansh");

        let result = Config::load(&CliOverrides::default());
        assert!(matches!(result, Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    #[serial]
    fn incomplete_mtls_is_rejected() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();
        env::set_var("TARGET_URL", "http://localhost:8080");
        env::set_var("PUZZLE_ID", "d4725144");
        env::set_var("UID", "vansh");
        env::set_var("CLIENT_CERT_PATH", "/tmp/cert.pem");

        let result = Config::load(&CliOverrides::default());
        assert!(matches!(result, Err(ConfigError::IncompleteMtls)));
    }

    #[test]
    #[serial]
    fn requires_uid_or_random_mode() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();
        env::set_var("TARGET_URL", "http://localhost:8080");
        env::set_var("PUZZLE_ID", "d4725144");

        let result = Config::load(&CliOverrides::default());
        assert!(matches!(result, Err(ConfigError::MissingModeParams { .. })));
    }

    #[test]
    #[serial]
    fn random_uid_flag_satisfies_requirement() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();
        env::set_var("TARGET_URL", "http://localhost:8080");
        env::set_var("PUZZLE_ID", "d4725144");

        let cli = CliOverrides {
            random_uid: true,
            ..Default::default()
        };
        let config = Config::load(&cli).unwrap();
        assert_eq!(config.random_user_mode, RandomUserMode::PerRequest);
    }
}
