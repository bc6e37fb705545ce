use clap::Parser;

/// A mirror and validator for the did:plc directory.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub(crate) struct Options {
    /// Path to the SQLite database backing the mirror.
    #[arg(long, env = "PLC_MIRROR_DB", default_value = "plc-mirror.sqlite")]
    pub(crate) db: String,

    /// Address to bind the HTTP API to.
    #[arg(long, env = "PLC_MIRROR_LISTEN", default_value = "0.0.0.0:2483")]
    pub(crate) listen: String,

    /// Base URL of the upstream directory to mirror.
    #[arg(long, env = "PLC_MIRROR_UPSTREAM", default_value = "https://plc.directory")]
    pub(crate) upstream: String,

    /// Number of entries to request per `/export` page.
    #[arg(long, env = "PLC_MIRROR_PAGE_SIZE", default_value_t = 1000)]
    pub(crate) page_size: usize,

    /// Delay, in seconds, between polls once the importer has caught up.
    #[arg(long, env = "PLC_MIRROR_POLL_INTERVAL", default_value_t = 10)]
    pub(crate) poll_interval_secs: u64,

    /// Serve the HTTP API without running the importer.
    #[arg(long)]
    pub(crate) read_only: bool,
}
