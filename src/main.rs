mod cli;
mod cmd;
mod config;
mod cri;
mod error;
mod inject;
mod latch;
mod logger;
mod scenario;
mod shim;
mod spinner;
mod teardown;
mod watchdog;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    logger::init()?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "shimrace start");

    match cli::run() {
        Ok(result) => {
            info!("shimrace finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "shimrace failed");
            Err(err)
        }
    }
}
