use atrium_api::types::string::Datetime;
use serde::Deserialize;

mod api;
pub(crate) use api::serve;

mod db;
pub(crate) use db::Db;

pub(crate) mod importer;
pub(crate) use importer::run_importer;

#[derive(Debug, Deserialize)]
pub(crate) struct ExportParams {
    count: Option<usize>,
    after: Option<Datetime>,
}

impl ExportParams {
    fn bounded_count(&self) -> usize {
        self.count.unwrap_or(1000).min(1000)
    }
}
