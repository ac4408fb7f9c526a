use anyhow::Context;
use clap::Parser;
use pg_capture::{Config, Replicator};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-capture")]
#[command(about = "PostgreSQL logical replication change capture", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, value_name = "NAME", help = "Override replication.slot_name")]
    slot: Option<String>,

    #[arg(long, value_name = "NAME", help = "Override replication.publication")]
    publication: Option<String>,

    #[arg(long, value_name = "LSN", help = "Override replication.start_lsn, e.g. 0/16B3748")]
    start_lsn: Option<String>,
}

impl Args {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(slot) = &self.slot {
            config.replication.slot_name = slot.clone();
        }
        if let Some(publication) = &self.publication {
            config.replication.publication = publication.clone();
        }
        if let Some(start_lsn) = &self.start_lsn {
            config.replication.start_lsn = Some(start_lsn.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-capture");
    info!("Loading configuration from {:?}", args.config);

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;
    args.apply_overrides(&mut config);
    config.validate().context("invalid configuration")?;

    info!(
        postgres = ?config.postgres,
        slot = %config.replication.slot_name,
        publication = %config.replication.publication,
        output_plugin = %config.replication.output_plugin,
        format = ?config.sink.format,
        "Configuration summary"
    );

    let mut replicator = Replicator::new(config);
    match replicator.run().await {
        Ok(stats) => {
            info!(
                frames = stats.frames_received,
                events = stats.events_emitted,
                skipped = stats.frames_skipped,
                "pg-capture stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!("Replication failed: {}", e);
            Err(e).context("replication failed")
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_capture=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_capture=info,warn"))
    };

    // Logs go to stderr; stdout carries the change events.
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
