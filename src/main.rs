use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

mod cli;
mod mirror;
mod plc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let opts = cli::Options::parse();

    let db = mirror::Db::open(&opts.db, opts.read_only).await?;

    if !opts.read_only {
        let client = reqwest::Client::builder().user_agent("plc-mirror").build()?;

        let importer_db = db.clone();
        let upstream = opts.upstream.clone();
        let poll_interval = Duration::from_secs(opts.poll_interval_secs);
        let page_size = opts.page_size;

        tokio::spawn(async move {
            if let Err(e) =
                mirror::run_importer(importer_db, upstream, client, page_size, poll_interval).await
            {
                error!("Importer exited with an error: {e:?}");
            }
        });
    }

    let server_db = db.clone();
    let listen = opts.listen.clone();
    tokio::spawn(async move {
        if let Err(e) = mirror::serve(server_db, listen).await {
            error!("Mirror server exited with an error: {e:?}");
        }
    });

    tokio::signal::ctrl_c().await?;

    info!("Shutting down PLC mirror");
    db.close().await?;

    Ok(())
}
