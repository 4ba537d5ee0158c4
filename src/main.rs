use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use eltpipe::{
    ingester::KafkaIngester, metrics::setup_metrics_router, settings::Settings,
    shutdown::ShutdownCoordinator,
};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let settings = Settings::new(&args.config).context("cannot load config")?;

    if let Some(bind) = settings.metrics_bind.clone() {
        let router = setup_metrics_router().context("cannot install metrics recorder")?;
        tokio::spawn(async move {
            if let Err(e) = eltpipe::metrics::serve(router, &bind).await {
                error!("metrics server on {bind} failed: {e}");
            }
        });
    }

    let (coordinator, signal) = ShutdownCoordinator::new();
    let coordinator = Arc::new(coordinator);
    let listener = coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = listener.listen().await {
            error!("cannot listen for termination signals: {e}");
        }
    });

    let mut ingesters = JoinSet::new();
    for (name, cfg) in settings.ingesters {
        let signal = signal.clone();
        ingesters.spawn(async move {
            let ingester = KafkaIngester::from_settings(&name, &cfg)
                .await
                .with_context(|| format!("failed to create ingester {name}"))?;
            ingester
                .run(signal)
                .await
                .with_context(|| format!("ingester {name} failed"))
        });
    }

    let mut failed = false;
    while let Some(joined) = ingesters.join_next().await {
        let outcome = match joined {
            Ok(result) => result.map(|_| ()),
            Err(e) => Err(e).context("ingester task panicked"),
        };
        if let Err(e) = outcome {
            error!("{e:#}");
            failed = true;
            // one broken pipeline stops the others cleanly
            coordinator.trigger();
        }
    }

    if failed {
        bail!("exiting after ingester failure");
    }
    info!("all ingesters stopped");
    Ok(())
}
