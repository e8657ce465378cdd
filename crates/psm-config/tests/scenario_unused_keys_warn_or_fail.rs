use psm_config::{load_layered_yaml_from_strings, report_unused_keys, ConfigCommand, UnusedKeyPolicy};

const YAML: &str = r#"
tenant:
  tenant_id: "7f1c4a52-8a63-4c3f-9a0e-0c6a3b1f2d11"
ingest:
  identity_fields: [id, external_id]
retention:
  snapshot_days: 30
database:
  url_env: PSM_DATABASE_URL
legacy:
  ftp_host: "ftp.example.com"
"#;

#[test]
fn warn_mode_reports_without_error() {
    let loaded = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let report =
        report_unused_keys(ConfigCommand::Sync, &loaded.config_json, UnusedKeyPolicy::Warn)
            .expect("warn never errors");

    assert_eq!(report.command, "SYNC");
    assert!(report.unused_leaf_pointers.contains(&"/legacy/ftp_host".to_string()));
    // Sync does not read retention.
    assert!(report
        .unused_leaf_pointers
        .contains(&"/retention/snapshot_days".to_string()));
    assert!(!report
        .unused_leaf_pointers
        .iter()
        .any(|p| p.starts_with("/database")));
}

#[test]
fn fail_mode_errors_on_unused_keys() {
    let loaded = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let err = report_unused_keys(ConfigCommand::Serve, &loaded.config_json, UnusedKeyPolicy::Fail)
        .unwrap_err()
        .to_string();
    assert!(err.contains("CONFIG_UNUSED_KEYS"));
    assert!(err.contains("/legacy/ftp_host"));
}

#[test]
fn cleanup_consumes_retention() {
    let yaml = "retention:\n  snapshot_days: 7\ndatabase:\n  url_env: X\n";
    let loaded = load_layered_yaml_from_strings(&[yaml]).unwrap();
    let report =
        report_unused_keys(ConfigCommand::Cleanup, &loaded.config_json, UnusedKeyPolicy::Fail)
            .expect("all keys consumed");
    assert!(report.is_clean());
}
