use anyhow::Result;
use tracing_subscriber::EnvFilter;

use rashplayer::brain::BrainEngine;
use rashplayer::runner::Runner;
use rashplayer::shm::{SHM_NAME, SharedRegion};
use rashplayer::vision::VisionEngine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("rashplayer core starting");

    let region = match SharedRegion::attach(SHM_NAME) {
        Ok(region) => region,
        Err(e) => {
            eprintln!("failed to attach {SHM_NAME}: {e}");
            std::process::exit(1);
        }
    };

    let mut runner = Runner::new(region, VisionEngine::new(), BrainEngine::new());
    runner.set_action_log("actions.jsonl");

    tokio::select! {
        result = runner.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    }
}
