//! Boot-time bootstrap: `anvil run`.

use anvil::bootstrap::{Orchestrator, Readiness};
use anvil::config::Config;
use anyhow::Result;
use std::sync::Arc;

pub async fn cmd_run(config: Arc<Config>) -> Result<()> {
    let deps = super::host_collaborators(&config)?;
    let report = match Orchestrator::new(config.clone(), deps).run().await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Bootstrap failed: {}", e);
            return Err(e.into());
        }
    };

    for line in report.summary() {
        tracing::info!("{}", line);
    }
    if let Err(e) = report.save(&config.host.report_path) {
        tracing::warn!("{:#}", e);
    }

    println!();
    println!("{}", console::style("Bootstrap complete").bold().green());
    for line in report.summary() {
        println!("  {}", line);
    }
    if matches!(report.readiness, Readiness::TimedOut { .. }) {
        println!(
            "  {} {}",
            console::style("⚠").yellow(),
            "Check the workload logs before relying on this instance."
        );
    }
    println!();
    Ok(())
}
