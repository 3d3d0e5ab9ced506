//! Integration tests for environment variable and CLI-override precedence.
//!
//! `Config::load` merges environment variables with `CliOverrides`, with the
//! CLI always winning. These tests exercise that precedence across the
//! fields not already covered by `config`'s own unit tests.

use crossword_loadgen::config::{CliOverrides, Config, ConfigError, JourneyVariant, LoadSource};
use serial_test::serial;
use std::env;
use std::path::PathBuf;
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

fn set_required_base(target: &str, puzzle: &str, uid: &str) {
    env::set_var("TARGET_URL", target);
    env::set_var("PUZZLE_ID", puzzle);
    env::set_var("UID", uid);
}

#[test]
#[serial]
fn cli_rps_and_duration_override_env_wave_values() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("RPS", "5");
    env::set_var("DURATION_SECS", "60");

    let cli = CliOverrides {
        rps: Some(50),
        duration: Some(120),
        ..Default::default()
    };
    let config = Config::load(&cli).unwrap();
    match config.source {
        LoadSource::Wave { rps, duration_secs } => {
            assert_eq!(rps, 50);
            assert_eq!(duration_secs, 120);
        }
        _ => panic!("expected wave source"),
    }
}

#[test]
#[serial]
fn env_wave_values_used_when_cli_absent() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("RPS", "7");
    env::set_var("DURATION_SECS", "42");

    let config = Config::load(&CliOverrides::default()).unwrap();
    match config.source {
        LoadSource::Wave { rps, duration_secs } => {
            assert_eq!(rps, 7);
            assert_eq!(duration_secs, 42);
        }
        _ => panic!("expected wave source"),
    }
}

#[test]
#[serial]
fn cli_title_and_output_override_env() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("TITLE", "env title");
    env::set_var("OUTPUT", "/tmp/env-output.json");

    let cli = CliOverrides {
        title: Some("cli title".to_string()),
        output: Some(PathBuf::from("/tmp/cli-output.json")),
        ..Default::default()
    };
    let config = Config::load(&cli).unwrap();
    assert_eq!(config.title, "cli title");
    assert_eq!(config.output, Some(PathBuf::from("/tmp/cli-output.json")));
}

#[test]
#[serial]
fn title_falls_back_to_default_when_unset() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");

    let config = Config::load(&CliOverrides::default()).unwrap();
    assert_eq!(config.title, "load test");
    assert!(config.output.is_none());
}

#[test]
#[serial]
fn cli_uid_pool_size_overrides_env_random_uid_mode() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    env::set_var("TARGET_URL", "http://localhost:8080");
    env::set_var("PUZZLE_ID", "d4725144");
    env::set_var("RANDOM_UID_MODE", "per-request");

    let cli = CliOverrides {
        uid_pool_size: Some(25),
        ..Default::default()
    };
    let config = Config::load(&cli).unwrap();
    assert_eq!(
        config.random_user_mode,
        crossword_loadgen::config::RandomUserMode::Pool(25)
    );
}

#[test]
#[serial]
fn env_random_uid_mode_pool_spec_parses() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    env::set_var("TARGET_URL", "http://localhost:8080");
    env::set_var("PUZZLE_ID", "d4725144");
    env::set_var("RANDOM_UID_MODE", "pool:15");

    let config = Config::load(&CliOverrides::default()).unwrap();
    assert_eq!(
        config.random_user_mode,
        crossword_loadgen::config::RandomUserMode::Pool(15)
    );
}

#[test]
#[serial]
fn invalid_pool_spec_is_rejected() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    env::set_var("TARGET_URL", "http://localhost:8080");
    env::set_var("PUZZLE_ID", "d4725144");
    env::set_var("RANDOM_UID_MODE", "pool:not-a-number");

    let result = Config::load(&CliOverrides::default());
    assert!(matches!(result, Err(ConfigError::InvalidValue { var, .. }) if var == "RANDOM_UID_MODE"));
}

#[test]
#[serial]
fn journey_variant_env_parses_static_assets_variant() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("JOURNEY_VARIANT", "standard-plus-static-assets");

    let config = Config::load(&CliOverrides::default()).unwrap();
    assert_eq!(config.journey_variant, JourneyVariant::StandardPlusStaticAssets);
}

#[test]
#[serial]
fn journey_variant_defaults_to_standard_for_unknown_value() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("JOURNEY_VARIANT", "nonsense");

    let config = Config::load(&CliOverrides::default()).unwrap();
    assert_eq!(config.journey_variant, JourneyVariant::Standard);
}

#[test]
#[serial]
fn skip_tls_verify_is_env_only_toggle() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("https://localhost:8443", "d4725144", "vansh");
    env::set_var("SKIP_TLS_VERIFY", "true");

    let config = Config::load(&CliOverrides::default()).unwrap();
    assert!(config.skip_tls_verify);
}

#[test]
#[serial]
fn custom_headers_pass_through_from_env() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("CUSTOM_HEADERS", "X-Debug:1,X-Trace:abc");

    let config = Config::load(&CliOverrides::default()).unwrap();
    assert_eq!(config.custom_headers, Some("X-Debug:1,X-Trace:abc".to_string()));
}

#[test]
#[serial]
fn pool_sizing_env_vars_override_defaults() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("MAX_CONCURRENT_REQUESTS", "500");
    env::set_var("MAX_PER_HOST", "250");
    env::set_var("METRICS_PORT", "9102");

    let config = Config::load(&CliOverrides::default()).unwrap();
    assert_eq!(config.max_concurrent_requests, 500);
    assert_eq!(config.max_per_host, 250);
    assert_eq!(config.metrics_port, Some(9102));
}

#[test]
#[serial]
fn pool_sizing_defaults_when_unset() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");

    let config = Config::load(&CliOverrides::default()).unwrap();
    assert_eq!(config.max_concurrent_requests, 200);
    assert_eq!(config.max_per_host, 100);
    assert_eq!(config.metrics_port, None);
}

#[test]
#[serial]
fn invalid_metrics_port_is_rejected() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("METRICS_PORT", "not-a-port");

    let result = Config::load(&CliOverrides::default());
    assert!(matches!(result, Err(ConfigError::InvalidValue { var, .. }) if var == "METRICS_PORT"));
}

#[test]
#[serial]
fn cli_replay_file_overrides_env_replay_file() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("REPLAY_FILE", "env-trace.jsonl");
    env::set_var("SPEED_FACTOR", "3.0");

    let cli = CliOverrides {
        replay: Some(PathBuf::from("cli-trace.jsonl")),
        ..Default::default()
    };
    let config = Config::load(&cli).unwrap();
    match config.source {
        LoadSource::Replay { file, speed } => {
            assert_eq!(file, PathBuf::from("cli-trace.jsonl"));
            assert_eq!(speed, 3.0);
        }
        _ => panic!("expected replay source"),
    }
}

#[test]
#[serial]
fn invalid_speed_factor_is_rejected() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("REPLAY_FILE", "trace.jsonl");
    env::set_var("SPEED_FACTOR", "-1.0");

    let result = Config::load(&CliOverrides::default());
    assert!(matches!(result, Err(ConfigError::InvalidValue { var, .. }) if var == "SPEED_FACTOR"));
}

#[test]
#[serial]
fn verbosity_takes_the_max_of_cli_and_env() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("VERBOSITY", "3");

    let cli = CliOverrides {
        verbosity: 1,
        ..Default::default()
    };
    let config = Config::load(&cli).unwrap();
    assert_eq!(config.verbosity, 3);

    let cli_louder = CliOverrides {
        verbosity: 5,
        ..Default::default()
    };
    let config_louder = Config::load(&cli_louder).unwrap();
    assert_eq!(config_louder.verbosity, 5);
}

#[test]
#[serial]
fn dry_run_and_html_flags_are_or_of_cli_and_env() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("DRY_RUN", "true");

    let config = Config::load(&CliOverrides::default()).unwrap();
    assert!(config.dry_run);
    assert!(!config.emit_html);

    let cli = CliOverrides {
        html: true,
        ..Default::default()
    };
    let config2 = Config::load(&cli).unwrap();
    assert!(config2.dry_run);
    assert!(config2.emit_html);
}

#[test]
#[serial]
fn save_and_load_sessions_paths_come_from_env_when_cli_absent() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("SAVE_SESSIONS", "/tmp/sessions-out.json");
    env::set_var("LOAD_SESSIONS", "/tmp/sessions-in.json");

    let config = Config::load(&CliOverrides::default()).unwrap();
    assert_eq!(config.save_sessions, Some(PathBuf::from("/tmp/sessions-out.json")));
    assert_eq!(config.load_sessions, Some(PathBuf::from("/tmp/sessions-in.json")));
}

#[test]
#[serial]
fn series_defaults_when_env_unset() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");

    let config = Config::load(&CliOverrides::default()).unwrap();
    assert_eq!(config.series, "default");
}

#[test]
#[serial]
fn parallel_override_prefers_cli_over_env() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();
    set_required_base("http://localhost:8080", "d4725144", "vansh");
    env::set_var("PARALLEL", "8");

    let cli = CliOverrides {
        parallel: Some(32),
        ..Default::default()
    };
    let config = Config::load(&cli).unwrap();
    assert_eq!(config.parallel_override, Some(32));
}
