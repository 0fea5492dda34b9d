use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Work directory (defaults to ~/.spoolpilot).
    #[clap(short, long, global = true)]
    pub work_dir: Option<PathBuf>,
    /// Verbose file logging.
    #[clap(long, global = true)]
    pub debug: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Create the shared regions and fifos from etc/hosts.json + etc/dirs.json")]
    Init {},
    #[clap(about = "Run the dispatcher in the foreground")]
    Run {},
    #[clap(about = "Print host and queue state", name = "status")]
    Status {},
    #[clap(about = "Ask a running dispatcher to shut down")]
    Stop {},
    #[clap(about = "Pause admissions for one host")]
    Pause { alias: String },
    #[clap(about = "Resume admissions for one host")]
    Resume { alias: String },
    #[clap(about = "Toggle per-host debug level", name = "dbg")]
    Debug {
        alias: String,
        #[clap(long)]
        off: bool,
    },
    #[clap(about = "Ask the dispatcher to write a state dump event")]
    Dump {},
    #[clap(about = "Re-read etc/hosts.json into the host region")]
    Reload {},
}
