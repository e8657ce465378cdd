use anyhow::Result;
use clap::{Parser, Subcommand};
use psm_config::ConfigCommand;

mod commands;

use commands::GlobalOpts;

#[derive(Parser)]
#[command(name = "psm")]
#[command(about = "Property Sync Manager CLI", long_about = None)]
struct Cli {
    /// Layered config paths in merge order (base -> env -> tenant ...)
    #[arg(long = "config", global = true)]
    config_paths: Vec<String>,

    /// Tenant id; overrides tenant.tenant_id from config
    #[arg(long, global = true)]
    tenant: Option<String>,

    /// Fail instead of warn when config carries keys the command does not read
    #[arg(long, global = true, default_value_t = false)]
    strict_config: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Source / target collection registry
    Collection {
        #[command(subcommand)]
        cmd: CollectionCmd,
    },

    /// Normalize a JSON records file into a source collection
    Import {
        #[arg(long)]
        source: String,

        /// JSON array, or an object with a "data" array
        #[arg(long)]
        file: String,
    },

    /// Reconcile a source collection into a target collection
    Sync {
        #[arg(long)]
        source: String,

        #[arg(long)]
        target: String,

        /// Import this records file into the source first, under the same run
        #[arg(long)]
        file: Option<String>,
    },

    /// Overwrite a manually edited target record from its source
    AcceptSource {
        #[arg(long)]
        source: String,

        #[arg(long)]
        target: String,

        #[arg(long)]
        identity: String,
    },

    /// Apply an out-of-band edit to a target record (shallow merge)
    Edit {
        #[arg(long)]
        target: String,

        #[arg(long)]
        identity: String,

        /// Patch JSON object
        #[arg(long, conflicts_with = "patch_file")]
        patch: Option<String>,

        /// Path to a patch JSON file
        #[arg(long = "patch-file", conflicts_with = "patch")]
        patch_file: Option<String>,
    },

    /// Print target records with their manual-change flag and warning
    ShowTarget {
        #[arg(long)]
        target: String,
    },

    /// Print source records as imported
    ShowSource {
        #[arg(long)]
        source: String,
    },

    /// Print the most recent sync runs of the tenant
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Delete snapshots older than the retention horizon
    Cleanup {
        /// Overrides retention.snapshot_days from config
        #[arg(long)]
        retention_days: Option<u32>,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations. Guardrail: refuses while any sync run is PENDING unless --yes is provided.
    Migrate {
        /// Acknowledge that a run may be writing right now.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum CollectionCmd {
    Create {
        #[arg(long)]
        name: String,

        /// source | target
        #[arg(long)]
        kind: String,
    },

    List,

    /// Take a collection out of service; its records are kept
    Deactivate {
        #[arg(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience).
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();
    let opts = GlobalOpts {
        config_paths: cli.config_paths,
        tenant: cli.tenant,
        strict_config: cli.strict_config,
    };

    match cli.cmd {
        Commands::Db { cmd } => {
            let (_, settings) = commands::load_config(&opts, ConfigCommand::Sync)?;
            let store = commands::connect(&settings).await?;
            let pool = store.pool();
            match cmd {
                DbCmd::Status => {
                    let s = psm_db::status(pool).await?;
                    println!("db_ok={} has_properties_table={}", s.ok, s.has_properties_table);
                }
                DbCmd::Migrate { yes } => {
                    let n = psm_db::count_pending_runs(pool).await?;
                    if n > 0 && !yes {
                        anyhow::bail!(
                            "REFUSING MIGRATE: detected {} pending sync run(s). Re-run with: `psm db migrate --yes`",
                            n
                        );
                    }

                    psm_db::migrate(pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = psm_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Collection { cmd } => match cmd {
            CollectionCmd::Create { name, kind } => {
                commands::collection::create(&opts, &name, &kind).await?
            }
            CollectionCmd::List => commands::collection::list(&opts).await?,
            CollectionCmd::Deactivate { id } => commands::collection::deactivate(&opts, &id).await?,
        },

        Commands::Import { source, file } => commands::sync::import(&opts, &source, &file).await?,

        Commands::Sync {
            source,
            target,
            file,
        } => commands::sync::sync(&opts, &source, &target, file.as_deref()).await?,

        Commands::AcceptSource {
            source,
            target,
            identity,
        } => commands::sync::accept_source(&opts, &source, &target, &identity).await?,

        Commands::Edit {
            target,
            identity,
            patch,
            patch_file,
        } => commands::sync::edit(&opts, &target, &identity, patch, patch_file).await?,

        Commands::ShowTarget { target } => commands::collection::show_target(&opts, &target).await?,

        Commands::ShowSource { source } => commands::collection::show_source(&opts, &source).await?,

        Commands::Runs { limit } => commands::sync::runs(&opts, limit).await?,

        Commands::Cleanup { retention_days } => commands::sync::cleanup(&opts, retention_days).await?,
    }

    Ok(())
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
