//! `psm collection ...`, `psm show-source` and `psm show-target`.

use anyhow::{anyhow, bail, Context, Result};
use psm_config::ConfigCommand;
use psm_reconcile::RunError;
use psm_schemas::{CollectionId, CollectionKind};

use super::{open_session, print_json, GlobalOpts};

pub fn parse_kind(raw: &str) -> Result<CollectionKind> {
    CollectionKind::parse(raw)
        .ok_or_else(|| anyhow!("invalid --kind '{raw}'. expected one of: source | target"))
}

pub fn parse_collection_id(raw: &str, flag: &str) -> Result<CollectionId> {
    raw.parse()
        .with_context(|| format!("invalid --{flag} uuid: {raw}"))
}

pub async fn create(opts: &GlobalOpts, name: &str, kind: &str) -> Result<()> {
    let kind = parse_kind(kind)?;
    let s = open_session(opts, ConfigCommand::Sync).await?;
    let c = s.engine.create_collection(&s.ctx, name, kind).await?;
    println!("collection_id={}", c.collection_id);
    println!("tenant_id={}", c.tenant_id);
    println!("name={}", c.name);
    println!("kind={}", c.kind.as_str());
    Ok(())
}

pub async fn list(opts: &GlobalOpts) -> Result<()> {
    let s = open_session(opts, ConfigCommand::Sync).await?;
    for c in s.engine.list_collections(&s.ctx).await? {
        println!(
            "collection_id={} kind={} active={} name={}",
            c.collection_id,
            c.kind.as_str(),
            c.is_active,
            c.name
        );
    }
    Ok(())
}

pub async fn deactivate(opts: &GlobalOpts, id: &str) -> Result<()> {
    let id = parse_collection_id(id, "id")?;
    let s = open_session(opts, ConfigCommand::Sync).await?;
    let c = match s.engine.deactivate_collection(&s.ctx, id).await {
        Ok(c) => c,
        Err(e @ RunError::RunInProgress(_)) => bail!("REFUSING DEACTIVATE: {e}. Retry when it finishes."),
        Err(e) => return Err(e.into()),
    };
    println!("collection_id={}", c.collection_id);
    println!("kind={}", c.kind.as_str());
    println!("active={}", c.is_active);
    Ok(())
}

pub async fn show_source(opts: &GlobalOpts, source: &str) -> Result<()> {
    let source = parse_collection_id(source, "source")?;
    let s = open_session(opts, ConfigCommand::Sync).await?;
    let records = s.engine.list_source(&s.ctx, source).await?;
    print_json(&records)
}

pub async fn show_target(opts: &GlobalOpts, target: &str) -> Result<()> {
    let target = parse_collection_id(target, "target")?;
    let s = open_session(opts, ConfigCommand::Sync).await?;
    let records = s.engine.list_target(&s.ctx, target).await?;
    print_json(&records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_case_insensitive() {
        assert_eq!(parse_kind("Source").unwrap(), CollectionKind::Source);
        assert_eq!(parse_kind("TARGET").unwrap(), CollectionKind::Target);
        assert!(parse_kind("mirror").is_err());
    }

    #[test]
    fn bad_uuid_names_the_flag() {
        let err = parse_collection_id("nope", "source").unwrap_err();
        assert!(err.to_string().contains("--source"));
    }
}
