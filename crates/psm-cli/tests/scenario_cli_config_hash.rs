use predicates::prelude::*;
use std::fs;

/// `psm config-hash` prints a stable hash and the canonical JSON; layer
/// order matters and secret literals are refused. No database needed.
#[allow(deprecated)]
#[test]
fn config_hash_is_stable_and_layered() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("base.yaml");
    let tenant = dir.path().join("tenant.yaml");
    fs::write(&base, "retention:\n  snapshot_days: 30\ningest:\n  identity_fields: [id]\n")?;
    fs::write(&tenant, "retention:\n  snapshot_days: 7\n")?;

    let run = |paths: &[&std::path::Path]| -> anyhow::Result<String> {
        let mut cmd = assert_cmd::Command::cargo_bin("psm")?;
        cmd.current_dir(dir.path()).arg("config-hash").args(paths);
        let out = cmd.assert().success().get_output().stdout.clone();
        Ok(String::from_utf8(out)?)
    };

    let first = run(&[&base, &tenant])?;
    let again = run(&[&base, &tenant])?;
    assert_eq!(first, again);
    assert!(first.starts_with("config_hash="));
    assert!(first.contains("\"snapshot_days\":7"));

    let reversed = run(&[&tenant, &base])?;
    assert_ne!(first.lines().next(), reversed.lines().next());
    assert!(reversed.contains("\"snapshot_days\":30"));
    Ok(())
}

#[allow(deprecated)]
#[test]
fn config_hash_refuses_secret_literals() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let bad = dir.path().join("bad.yaml");
    fs::write(&bad, "database:\n  url: \"postgres://psm:hunter22@db:5432/psm\"\n")?;

    let mut cmd = assert_cmd::Command::cargo_bin("psm")?;
    cmd.current_dir(dir.path()).arg("config-hash").arg(&bad);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_SECRET_DETECTED"))
        .stderr(predicate::str::contains("hunter22").not());
    Ok(())
}
