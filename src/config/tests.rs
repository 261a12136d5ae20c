use std::env;
use std::fs;

use serial_test::serial;
use tempfile::TempDir;

use super::load_config;
use super::settings::Settings;
use crate::broker::exchange::ExchangeKind;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.log.level, "info");
    assert_eq!(settings.broker.default_max_queue_length, None);
    assert_eq!(settings.broker.max_redeliveries, 5);
    assert!(!settings.persistence.enabled);
    assert_eq!(settings.persistence.path, "switchyard_db");
    assert!(settings.topology.exchanges.is_empty());
    assert!(settings.topology.queues.is_empty());
    assert!(settings.topology.bindings.is_empty());
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    // Run in a temporary directory so load_config picks up the
    // config/default.toml written here and nothing else.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [log]
        level = "warn"

        [broker]
        default_max_queue_length = 64
        max_redeliveries = 2

        [persistence]
        enabled = true
        path = "state"

        [[topology.exchanges]]
        name = "exchange_topics_inform"
        kind = "topic"
        durable = true

        [[topology.queues]]
        name = "queue_inform_email"
        durable = true

        [[topology.bindings]]
        exchange = "exchange_topics_inform"
        queue = "queue_inform_email"
        pattern = "inform.#.email.#"
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config().expect("load_config failed");
    assert_eq!(cfg.log.level, "warn");
    assert_eq!(cfg.broker.default_max_queue_length, Some(64));
    assert_eq!(cfg.broker.max_redeliveries, 2);
    assert!(cfg.persistence.enabled);
    assert_eq!(cfg.persistence.path, "state");
    assert_eq!(cfg.topology.exchanges.len(), 1);
    assert_eq!(cfg.topology.exchanges[0].kind, ExchangeKind::Topic);
    assert_eq!(cfg.topology.queues.len(), 1);
    assert_eq!(cfg.topology.bindings[0].pattern, "inform.#.email.#");

    env::set_current_dir(orig).expect("restore cwd");
}

#[test]
#[serial]
fn test_environment_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    temp_env::with_var("LOG_LEVEL", Some("debug"), || {
        let cfg = load_config().expect("load_config failed");
        assert_eq!(cfg.log.level, "debug");
        // Untouched sections keep their defaults.
        assert_eq!(cfg.broker.max_redeliveries, 5);
    });

    env::set_current_dir(orig).expect("restore cwd");
}

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    let cfg = load_config().expect("load_config failed");
    assert_eq!(cfg.log.level, Settings::default().log.level);
    assert!(cfg.topology.exchanges.is_empty());

    env::set_current_dir(orig).expect("restore cwd");
}
