use anyhow::Result;
use amostat_core::OwnerKind;
use amostat_sync::{SyncConfig, SyncContext};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "amostat")]
#[command(about = "amoCRM client status sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Contact,
    Company,
}

impl From<KindArg> for OwnerKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Contact => OwnerKind::Contact,
            KindArg::Company => OwnerKind::Company,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the scheduler when enabled).
    Serve,
    /// Sweep every contact or company once.
    Check {
        #[arg(value_enum)]
        kind: KindArg,
    },
    /// Discover and persist the sales pipeline stage ids.
    Discover,
    /// Exchange an authorization code and register the webhook.
    Install {
        #[arg(long, env = "AMO_AUTH_CODE")]
        auth_code: String,
    },
    /// Remove the registered webhook.
    Uninstall,
    /// Apply the settings database migrations.
    Migrate,
}

fn init_tracing() {
    if tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .finish(),
    )
    .is_err()
    {
        // already installed
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => amostat_web::serve_from_env().await?,
        Commands::Check { kind } => {
            let result = amostat_sync::run_bulk_check_from_env(kind.into()).await?;
            println!(
                "check complete: run_id={} evaluated={} skipped={} entities={} leads={}",
                result.run_id,
                result.owners_evaluated,
                result.owners_skipped,
                result.entities_written,
                result.leads_written
            );
        }
        Commands::Discover => {
            let ctx = SyncContext::from_env().await?;
            let config = ctx.engine.pipeline_config().await?;
            println!(
                "pipeline={} success_stage={} inactive_stages={:?}",
                config.pipeline_id, config.success_stage_id, config.inactive_stage_ids
            );
        }
        Commands::Install { auth_code } => {
            let ctx = SyncContext::from_env().await?;
            let created = ctx.install(&auth_code).await?;
            println!("install complete: webhook_created={created}");
        }
        Commands::Uninstall => {
            let ctx = SyncContext::from_env().await?;
            ctx.uninstall().await?;
            println!("webhook removed");
        }
        Commands::Migrate => {
            amostat_sync::run_migrations(&SyncConfig::from_env()).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
