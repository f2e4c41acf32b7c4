use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "kview",
    version,
    about = "Live Kubernetes tables with change tracking and pod port-forwards."
)]
pub struct CliArgs {
    /// Refresh interval in milliseconds
    #[arg(long)]
    pub refresh_ms: Option<u64>,

    /// Start in a specific namespace
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Start with all namespaces selected
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    /// Kubeconfig context to use instead of the current one
    #[arg(long)]
    pub context: Option<String>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,

    /// Write logs to this file; logs are discarded otherwise
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Local address port-forwards listen on
    #[arg(long)]
    pub port_forward_address: Option<String>,
}
