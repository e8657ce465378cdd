//! Config hash is a function of the merged content, not of key order or
//! layer boundaries.

use psm_config::load_layered_yaml_from_strings;

#[test]
fn key_order_does_not_change_hash() {
    let a = r#"
retention:
  snapshot_days: 30
ingest:
  identity_fields: [id, external_id]
"#;
    let b = r#"
ingest:
  identity_fields: [id, external_id]
retention:
  snapshot_days: 30
"#;
    let la = load_layered_yaml_from_strings(&[a]).expect("load a");
    let lb = load_layered_yaml_from_strings(&[b]).expect("load b");

    assert_eq!(la.config_hash, lb.config_hash);
    assert_eq!(la.canonical_json, lb.canonical_json);
    assert_eq!(la.config_hash.len(), 64);
}

#[test]
fn split_layers_hash_like_single_document() {
    let base = "retention:\n  snapshot_days: 30\n";
    let over = "ingest:\n  identity_fields: [id]\n";
    let merged = "retention:\n  snapshot_days: 30\ningest:\n  identity_fields: [id]\n";

    let layered = load_layered_yaml_from_strings(&[base, over]).unwrap();
    let single = load_layered_yaml_from_strings(&[merged]).unwrap();
    assert_eq!(layered.config_hash, single.config_hash);
}

#[test]
fn value_change_changes_hash() {
    let a = load_layered_yaml_from_strings(&["retention:\n  snapshot_days: 30\n"]).unwrap();
    let b = load_layered_yaml_from_strings(&["retention:\n  snapshot_days: 31\n"]).unwrap();
    assert_ne!(a.config_hash, b.config_hash);
}
