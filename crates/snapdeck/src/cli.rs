use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "snapdeck", version, about = "ZFS snapshot management service")]
pub(crate) struct Args {
    #[arg(long, default_value = "config/snapdeck.toml")]
    pub(crate) config: PathBuf,
    #[arg(long, default_value = "127.0.0.1:19310")]
    pub(crate) listen_addr: String,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
    /// Also write JSON logs to a daily rolling file in this directory.
    #[arg(long)]
    pub(crate) log_dir: Option<PathBuf>,
}
