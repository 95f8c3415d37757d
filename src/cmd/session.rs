use anyhow::{Context, Result};
use tracing::info;

use npu_link::cancel::CancelToken;
use npu_link::dispatch::Dispatcher;
use npu_link::error::LinkError;
use npu_link::postprocess::{Handoff, NodeSummary};
use npu_link::session::DualSessionPipeline;
use npu_link::stats::Stats;

use super::{dims, feed, load_images, report};
use crate::cli::SessionOpts;
use crate::port::open_port;

pub fn run(opts: SessionOpts, cancel: CancelToken) -> Result<()> {
    let images = load_images(&opts.input.images)?;
    let config = std::fs::read(&opts.config)
        .with_context(|| format!("reading session config {}", opts.config.display()))?;
    let port = open_port(&opts.ser)?;
    let mut dev = Dispatcher::new(port, opts.link.to_config()).with_cancel(cancel);

    if let Some(path) = &opts.model {
        let model =
            std::fs::read(path).with_context(|| format!("reading model {}", path.display()))?;
        let fw_info = match &opts.fw_info {
            Some(p) => std::fs::read(p).with_context(|| format!("reading {}", p.display()))?,
            None => Vec::new(),
        };
        dev.dme_start(&model, &fw_info).context("loading model")?;
    }
    let model_id = dev.dme_configure(&config).context("configuring session mode")?;

    let mut handoff = Handoff::new(NodeSummary, model_id as u32, dims(&opts.input));
    let verbose = opts.input.verbose;
    let mut pipeline = DualSessionPipeline::new(&mut dev, model_id);
    pipeline.stats = Stats::new("session").with_interval(opts.link.stats_interval());
    let turns = opts.turns.or(opts.input.count);
    let outcome = pipeline.run(feed(&images, turns), |done| {
        let nodes = handoff.deliver(&done.raw)?;
        report(done.input, &nodes, verbose);
        Ok(())
    });
    let bad = pipeline.stats.bad;

    match outcome {
        // sessions still on the device are discarded by the mode reset below
        Err(LinkError::Cancelled) => info!("session run stopped before drain"),
        other => other.context("session run")?,
    }
    if !dev.cancel_token().is_forced() {
        dev.end_mode().context("ending session mode")?;
    }
    info!(delivered = handoff.delivered, bad, "session done");
    Ok(())
}
