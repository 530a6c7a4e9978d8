use anyhow::{Context, Result};
use clap::Parser;

use dashfm::cli::DaemonOpts;
use dashfm::protocol::VERSION;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    if !opts.root.exists() {
        anyhow::bail!("Error: Root directory does not exist: {}", opts.root.display());
    }
    if !opts.root.is_dir() {
        anyhow::bail!("Error: Root path is not a directory: {}", opts.root.display());
    }

    let canonical_root = std::fs::canonicalize(&opts.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", opts.root.display()))?;

    println!("Starting dashfm agent:");
    println!("  Root: {}", canonical_root.display());
    println!("  Bind: {}", opts.bind);
    println!("  Wire: v{} (plain ws://)", VERSION);

    if opts.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the served directory on all interfaces");
        eprintln!("   There is no authentication; put the agent behind the dashboard's proxy");
        eprintln!();
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(dashfm::server::serve(&opts.bind, &canonical_root))
}
