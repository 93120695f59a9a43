use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "alert-ingester",
    version,
    about = "Fetch Avro alert packets from Kafka streams and ingest them into the document store"
)]
pub struct Args {
    /// Observing date (YYYYMMDD, default: today UTC)
    #[arg(long)]
    pub obsdate: Option<String>,
    /// Reduce i/o: do not save packets to disk
    #[arg(long, default_value_t = false)]
    pub noio: bool,
    /// Listen to the test broker and make a single pass
    #[arg(long, default_value_t = false)]
    pub test: bool,
    /// Path to the JSON config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}
