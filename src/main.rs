use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use npu_link::cancel::CancelToken;

mod cli;
mod cmd;
mod port;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let level = args.log_level();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    // First Ctrl-C stops submitting and drains; a second abandons the drain.
    let cancel = CancelToken::new();
    let c = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received");
        c.escalate();
    })
    .context("installing Ctrl-C handler")?;

    match args.cmd {
        cli::Cmd::Status(opts) => cmd::status::run(opts, cancel),
        cli::Cmd::Reset(opts) => cmd::status::reset(opts, cancel),
        cli::Cmd::Stream(opts) => cmd::stream::run(opts, cancel),
        cli::Cmd::Session(opts) => cmd::session::run(opts, cancel),
        cli::Cmd::Parse(opts) => cmd::parse::run(opts),
    }
}
