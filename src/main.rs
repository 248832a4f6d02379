use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use tax_policy_harvester::{harvest, logger, open_store, Cli, RunStats, Site};
use tax_policy_harvester::{BeijingAdapter, BrowserDriver, HttpDriver, NingboAdapter, PageDriver};
use tax_policy_harvester::{ShandongAdapter, ShanghaiAdapter, StatusTable};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    logger::init();
    let cli = Cli::parse();

    // Configuration problems stop the run before any request goes out.
    let output = cli.output_path()?;
    let config = cli.harvest_config()?;
    let selection = cli.selection();

    info!("Starting tax policy harvest...");
    info!("Site: {}", cli.site);
    info!("Regions: {} | Categories: {}", cli.regions, cli.categories);
    info!("Output: {:?}", output);
    info!(
        "Concurrency: {} | flush every {} records | timeout {:?}",
        config.concurrency, config.flush_threshold, config.fetch_timeout
    );

    // Ningbo only pages forward by clicking, so it needs a real browser.
    let driver: Arc<dyn PageDriver> = match cli.site {
        Site::Ningbo => Arc::new(BrowserDriver::launch().await?),
        _ => Arc::new(HttpDriver::new()?),
    };
    let store = open_store(&output);
    let timeout = config.fetch_timeout;

    let result = match cli.site {
        Site::Beijing => {
            let adapter = BeijingAdapter::new(driver, StatusTable::chinatax()).with_timeout(timeout);
            harvest(&adapter, store.as_ref(), config, &selection).await
        }
        Site::Shanghai => {
            let adapter = ShanghaiAdapter::new(driver).with_timeout(timeout);
            harvest(&adapter, store.as_ref(), config, &selection).await
        }
        Site::Shandong => {
            let adapter = ShandongAdapter::new(driver).with_timeout(timeout);
            harvest(&adapter, store.as_ref(), config, &selection).await
        }
        Site::Ningbo => {
            let adapter = NingboAdapter::new(driver).with_timeout(timeout);
            harvest(&adapter, store.as_ref(), config, &selection).await
        }
    };

    let stats = match result {
        Ok(stats) => stats,
        Err(e) => {
            error!("Invalid selection: {}", e);
            return Err(e.into());
        }
    };
    report(&stats);
    Ok(())
}

fn report(stats: &RunStats) {
    for key in &stats.keys {
        info!(
            "  {:<24} pages {:>4} | new {:>6} | failed details {:>4}",
            key.key, key.pages, key.new_records, key.failed_details
        );
    }
    info!(
        "Harvest completed. {} new records, {} failed details, {}/{} saves succeeded.",
        stats.new_records(),
        stats.failed_details(),
        stats.saves - stats.failed_saves,
        stats.saves
    );
    if stats.failed_saves > 0 {
        error!("Some saves failed; rerun after closing the output file to persist everything.");
    }
}
