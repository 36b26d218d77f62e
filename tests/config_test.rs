use std::time::Duration;

use syncqueue::config::{Config, MAX_BACKOFF_MS};
use syncqueue::error::Error;
use syncqueue::queue::rate_limiter::RateLimiter;

const VARS: [&str; 6] = [
    "SYNCQUEUE_WORKERS",
    "SYNCQUEUE_MAX_RETRIES",
    "SYNCQUEUE_BACKOFF_BASE_MS",
    "SYNCQUEUE_BACKOFF_MAX_MS",
    "SYNCQUEUE_QPS",
    "SYNCQUEUE_BURST",
];

fn clear_vars() {
    for var in VARS {
        unsafe { std::env::remove_var(var) };
    }
}

// Environment access is process-wide, so every env case lives in one test.
#[test]
fn config_from_env() {
    clear_vars();
    let config = Config::from_env().unwrap();
    assert_eq!(config.workers, 1);
    assert_eq!(config.max_retries, 3);
    assert!(!config.log_level.is_empty());

    unsafe {
        std::env::set_var("SYNCQUEUE_WORKERS", "8");
        std::env::set_var("SYNCQUEUE_MAX_RETRIES", " 5 ");
        std::env::set_var("SYNCQUEUE_BACKOFF_BASE_MS", "10");
        std::env::set_var("SYNCQUEUE_QPS", "2.5");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.workers, 8);
    assert_eq!(config.max_retries, 5);
    assert_eq!(config.backoff_base_ms, 10);
    assert_eq!(config.qps, 2.5);

    unsafe { std::env::set_var("SYNCQUEUE_WORKERS", "many") };
    let err = Config::from_env().unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.to_string().contains("SYNCQUEUE_WORKERS"));

    unsafe { std::env::set_var("SYNCQUEUE_WORKERS", "0") };
    assert!(Config::from_env().is_err());

    clear_vars();
}

#[test]
fn config_from_toml_file() {
    let path = std::env::temp_dir().join(format!("syncqueue-config-{}.toml", std::process::id()));
    std::fs::write(&path, "workers = 4\nmax_retries = 2\nbackoff_max_ms = 500\n").unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.workers, 4);
    assert_eq!(config.max_retries, 2);
    assert_eq!(config.backoff_max_ms, 500);
    assert_eq!(config.burst, Config::default().burst);

    std::fs::write(&path, "workers = 4\nunknown = true\n").unwrap();
    assert!(matches!(Config::from_file(&path), Err(Error::Config(_))));

    std::fs::remove_file(&path).unwrap();
    assert!(matches!(Config::from_file(&path), Err(Error::Io(_))));
}

#[test]
fn validate_rejects_inverted_backoff() {
    let config = Config {
        backoff_base_ms: 100,
        backoff_max_ms: 10,
        ..Config::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_unusable_rates() {
    for qps in [0.0, -1.0, 1e-300, f64::NAN, f64::INFINITY] {
        let config = Config {
            qps,
            ..Config::default()
        };
        assert!(config.validate().is_err(), "qps {qps} accepted");
    }

    let config = Config {
        backoff_max_ms: MAX_BACKOFF_MS + 1,
        ..Config::default()
    };
    assert!(config.validate().is_err());

    let config = Config {
        qps: 0.5,
        backoff_max_ms: MAX_BACKOFF_MS,
        ..Config::default()
    };
    assert!(config.validate().is_ok());
}

#[test]
fn rate_limiter_follows_backoff_settings() {
    let config = Config {
        backoff_base_ms: 10,
        backoff_max_ms: 25,
        ..Config::default()
    };
    let limiter = config.rate_limiter::<&str>();
    assert_eq!(limiter.when(&"k"), Duration::from_millis(10));
    assert_eq!(limiter.when(&"k"), Duration::from_millis(20));
    assert_eq!(limiter.when(&"k"), Duration::from_millis(25));
    assert_eq!(limiter.num_requeues(&"k"), 3);
}
