use std::time::Duration;

use atrium_api::types::string::Datetime;
use reqwest::Client;
use tracing::error;

use crate::plc::LogEntry;

use super::Db;

/// Polls the upstream directory's `/export` endpoint on a cursor and
/// imports new entries into storage, backing off once a page comes back
/// smaller than requested (we've caught up).
pub(crate) async fn run_importer(
    db: Db,
    upstream: String,
    client: Client,
    page_size: usize,
    catch_up_backoff: Duration,
) -> anyhow::Result<()> {
    let mut after = db.get_last_created().await?;

    loop {
        let imported = match export(&upstream, after.as_ref(), page_size, &client).await {
            Err(e) => {
                error!("Failed to export entries from upstream PLC directory: {e:?}");
                0
            }
            Ok(entries) => match db.import(entries).await {
                Ok(None) => 0,
                Ok(Some((last_created_at, imported))) => {
                    after = Some(last_created_at);
                    imported
                }
                Err(e) => {
                    error!("Failed to import entries: {e}");
                    0
                }
            },
        };

        if imported < page_size {
            // We've caught up.
            tokio::time::sleep(catch_up_backoff).await;
        }
    }
}

async fn export(
    upstream: &str,
    after: Option<&Datetime>,
    page_size: usize,
    client: &Client,
) -> anyhow::Result<Vec<LogEntry>> {
    let mut url = format!("{upstream}/export?count={page_size}");
    if let Some(after) = after {
        url.push_str("&after=");
        url.push_str(after.as_str());
    }

    let resp = client.get(url).send().await?.error_for_status()?;
    let body = resp.text().await?;

    body.lines()
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str::<LogEntry>(line).map_err(anyhow::Error::from))
        .collect()
}
