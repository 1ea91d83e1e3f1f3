use anyhow::Result;
use tracing::warn;

use charge_dispatch_core::app::System;
use charge_dispatch_core::config::Config;
use charge_dispatch_core::telemetry::{self, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load()?;
    init_tracing(&cfg.telemetry);

    let system = System::new(cfg).await?;
    system.spawn_workers().await;

    telemetry::shutdown_signal().await;

    system.shutdown().await;
    warn!("shutdown complete");
    Ok(())
}
