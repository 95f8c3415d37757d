use anyhow::{Context, Result};
use tracing::info;

use npu_link::cancel::CancelToken;
use npu_link::dispatch::Dispatcher;
use npu_link::error::LinkError;
use npu_link::postprocess::{Handoff, NodeSummary};
use npu_link::proto::message::StreamProfile;
use npu_link::stats::Stats;
use npu_link::stream::StreamPipeline;

use super::{dims, feed, load_images, report};
use crate::cli::StreamOpts;
use crate::port::open_port;

pub fn run(opts: StreamOpts, cancel: CancelToken) -> Result<()> {
    let images = load_images(&opts.input.images)?;
    let port = open_port(&opts.ser)?;
    let mut dev = Dispatcher::new(port, opts.link.to_config()).with_cancel(cancel);

    let profile = StreamProfile {
        app_id: opts.app_id,
        result_size: opts.result_size,
        width: opts.input.width,
        height: opts.input.height,
        format: opts.format,
    };
    let mut stream = StreamPipeline::start(&mut dev, &profile).context("starting stream")?;
    stream.stats = Stats::new("stream").with_interval(opts.link.stats_interval());
    stream.set_fill_target(opts.window_target);
    if let Some(model_id) = opts.model_id {
        stream
            .configure(model_id, opts.param)
            .with_context(|| format!("selecting model {model_id}"))?;
    }

    let mut handoff = Handoff::new(NodeSummary, opts.model_id.unwrap_or(0), dims(&opts.input));
    let verbose = opts.input.verbose;
    let outcome = stream.run(feed(&images, opts.input.count), |r| {
        let nodes = handoff.deliver(&r.raw)?;
        report(r.id as u64, &nodes, verbose);
        Ok(())
    });
    let bad = stream.stats.bad;
    let stopped = stream.stop();

    match outcome {
        Err(LinkError::Cancelled) => info!("stream abandoned on forced stop"),
        other => other.context("stream run")?,
    }
    stopped.context("ending stream mode")?;
    info!(delivered = handoff.delivered, bad, "stream done");
    Ok(())
}
