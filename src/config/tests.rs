#![cfg(test)]

use std::path::PathBuf;

use crate::config::config::{Config, ConfigError};

const BASIC: &str = r#"
    [relay]
    id = "relay-test"
    ae_title = "RTRELAY"
    port = 11112
    storage_dir = "/data/received"

    [logging]
    level = "debug"

    [sender]
    workers = 2
    heartbeat_interval_secs = 0

    [watcher]
    enabled = true
    watch_dir = "/data/import"
    inactivity_timeout_secs = 20

    [forwarding]
    label_case_sensitive = false

    [[forwarding.rules]]
    name = "adaptive"
    source_ae = "FOLLOW"
    plan_label_match = "ADP"
    targets = ["tps", "archive"]

    [[forwarding.rules]]
    name = "imports"
    source_ae = "IMPORT_FOLDER"
    targets = ["archive"]

    [[nodes]]
    name = "tps"
    ae_title = "TPS_SCP"
    host = "10.0.0.5"
    port = 104

    [[nodes]]
    name = "archive"
    enabled = false
    ae_title = "ARCHIVE"
    calling_ae_title = "RELAY_OUT"
    host = "archive.local"
    port = 11112

    [[trust]]
    ae_title = "FOLLOW"
    directory = "follow"

    [[trust]]
    ae_title = "OLD_TPS"
    allowed = false
"#;

#[test]
fn test_basic_config() {
    let config = Config::parse(BASIC).expect("config should parse and validate");

    assert_eq!(config.relay.id, "relay-test");
    assert_eq!(config.relay.storage_dir, PathBuf::from("/data/received"));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.sender.workers, 2);
    assert!(config.sender.heartbeat_interval().is_none());
    assert_eq!(config.watcher.failed_dir(), PathBuf::from("/data/import/failed"));
    assert_eq!(config.watcher.file_extensions, vec!["dcm"]);
    assert!(!config.forwarding.label_case_sensitive);
    assert!(config.forwarding.rules_enabled);
    assert_eq!(config.forwarding.rules[1].plan_label_match, "");
    assert!(config.nodes[0].enabled);
    assert!(!config.nodes[1].enabled);
    assert!(config.trust[0].allowed);
    assert!(!config.trust[1].allowed);
    assert!(config.unknown_rule_targets().is_empty());
}

#[test]
fn test_defaults_apply_to_empty_file() {
    let config = Config::parse("").expect("empty config is valid");
    assert_eq!(config.relay.ae_title, "RTRELAY");
    assert_eq!(config.relay.port, 11112);
    assert_eq!(config.sender.workers, 4);
    assert_eq!(config.watcher.inactivity_timeout_secs, 13);
    assert!(!config.watcher.enabled);
    assert!(config.nodes.is_empty());
}

#[test]
fn test_dimse_config_mirrors_relay() {
    let config = Config::parse(BASIC).unwrap();
    let dimse = config.dimse_config();
    assert_eq!(dimse.local_aet, "RTRELAY");
    assert_eq!(dimse.port, 11112);
    assert_eq!(dimse.max_associations, config.relay.max_associations);
    assert!(dimse.validate().is_ok());
}

#[test]
fn test_rejects_long_ae_title() {
    let err = Config::parse("[relay]\nae_title = \"THIS_AE_IS_FAR_TOO_LONG\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::InvalidAeTitle { .. }));
}

#[test]
fn test_rejects_zero_workers() {
    let err = Config::parse("[sender]\nworkers = 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::NoWorkers));
}

#[test]
fn test_rejects_duplicate_nodes() {
    let toml = r#"
        [[nodes]]
        name = "a"
        ae_title = "A"
        host = "h"
        port = 104

        [[nodes]]
        name = "a"
        ae_title = "B"
        host = "h"
        port = 105
    "#;
    assert!(matches!(
        Config::parse(toml).unwrap_err(),
        ConfigError::DuplicateNode(name) if name == "a"
    ));
}

#[test]
fn test_rejects_duplicate_trust_and_bad_port() {
    let toml = r#"
        [[trust]]
        ae_title = "X"
        [[trust]]
        ae_title = "X"
    "#;
    assert!(matches!(
        Config::parse(toml).unwrap_err(),
        ConfigError::DuplicateTrust(_)
    ));

    let toml = r#"
        [[nodes]]
        name = "a"
        ae_title = "A"
        host = "h"
        port = 0
    "#;
    assert!(matches!(
        Config::parse(toml).unwrap_err(),
        ConfigError::InvalidPort(_)
    ));
}

#[test]
fn test_unknown_targets_are_warnings_only() {
    let toml = r#"
        [[forwarding.rules]]
        name = "r"
        source_ae = "FOLLOW"
        targets = ["nowhere"]
    "#;
    let config = Config::parse(toml).expect("unknown targets do not fail validation");
    assert_eq!(
        config.unknown_rule_targets(),
        vec![("r".to_string(), "nowhere".to_string())]
    );
}

#[test]
fn test_parse_error_is_reported() {
    assert!(matches!(
        Config::parse("[relay\n").unwrap_err(),
        ConfigError::Parse(_)
    ));
}

#[test]
fn test_restart_required_sections() {
    let current = Config::parse(BASIC).unwrap();
    let mut next = current.clone();
    next.forwarding.rules.clear();
    next.relay.stale_plan_secs += 60;
    next.relay.late_object_window_secs += 60;
    assert!(current.restart_required(&next).is_empty());

    next.sender.workers = 8;
    next.conversion.timeout_secs = 5;
    next.relay.port = 11113;
    assert_eq!(current.restart_required(&next), vec!["relay", "sender", "conversion"]);
}
