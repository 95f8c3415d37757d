use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{debug, info};

use npu_link::postprocess::{InputDims, NodeStat};

use crate::cli::InputOpts;

pub mod parse;
pub mod session;
pub mod status;
pub mod stream;

pub fn load_images(paths: &[PathBuf]) -> Result<Vec<Vec<u8>>> {
    paths
        .iter()
        .map(|p| std::fs::read(p).with_context(|| format!("reading image {}", p.display())))
        .collect()
}

/// Images in submission order: cycled to `count`, forever when `count` is 0.
pub fn feed(images: &[Vec<u8>], count: Option<u64>) -> impl Iterator<Item = &Vec<u8>> {
    let total = match count {
        None => images.len(),
        Some(0) => usize::MAX,
        Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
    };
    images.iter().cycle().take(total)
}

pub fn dims(input: &InputOpts) -> InputDims {
    InputDims {
        raw_width: input.width as u32,
        raw_height: input.height as u32,
        model_width: input.model_width,
        model_height: input.model_height,
    }
}

pub fn report(input: u64, nodes: &[NodeStat], verbose: bool) {
    for n in nodes {
        if verbose {
            info!(
                input,
                node = n.node_id,
                "{}x{}x{} peak {:.4} @{}",
                n.channels,
                n.rows,
                n.cols,
                n.max,
                n.argmax
            );
        } else {
            debug!(input, node = n.node_id, peak = n.max, at = n.argmax, "node");
        }
    }
}
