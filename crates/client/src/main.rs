mod app;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use skein::config::SessionConfig;
use skein::content::StaticContent;

use app::App;

#[derive(Parser)]
#[command(name = "skein-client")]
#[command(about = "Headless Skein client: joins a server and mirrors its world")]
struct Args {
    /// Server address, e.g. 127.0.0.1:10555
    #[arg(short, long)]
    server: Option<String>,

    #[arg(short, long)]
    username: Option<String>,

    /// Content manifest; its lump checksums must match the server's.
    #[arg(long)]
    content: Option<PathBuf>,

    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many ticks instead of running until disconnected.
    #[arg(long)]
    ticks: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(username) = args.username {
        config.username = username;
    }
    let server = args.server.unwrap_or_else(|| config.socket_addr());

    let content = match &args.content {
        Some(path) => StaticContent::load(path)
            .with_context(|| format!("failed to load content from {}", path.display()))?,
        None => StaticContent::empty(),
    };

    let mut app = App::connect(&server, content, config)?;
    app.run(args.ticks);
    Ok(())
}
