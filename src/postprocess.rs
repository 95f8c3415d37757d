//! Hand-off of assembled results to a post-processing stage.

use crate::error::Result;
use crate::result::{self, NodeView};

/// Raw camera frame versus what the model consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputDims {
    pub raw_width: u32,
    pub raw_height: u32,
    pub model_width: u32,
    pub model_height: u32,
}

/// Turns output nodes into typed results for one model family.
pub trait PostProcess {
    type Output;

    fn process(
        &mut self,
        model_id: u32,
        nodes: &[NodeView<'_>],
        dims: &InputDims,
    ) -> Result<Self::Output>;
}

/// Parses each raw result and feeds it to `P`.
pub struct Handoff<P: PostProcess> {
    post: P,
    model_id: u32,
    dims: InputDims,
    pub delivered: u64,
}

impl<P: PostProcess> Handoff<P> {
    pub fn new(post: P, model_id: u32, dims: InputDims) -> Self {
        Self {
            post,
            model_id,
            dims,
            delivered: 0,
        }
    }

    /// A malformed buffer comes back as a result-local error, which the
    /// pipelines count and skip.
    pub fn deliver(&mut self, raw: &[u8]) -> Result<P::Output> {
        let nodes = result::parse(raw)?;
        let out = self.post.process(self.model_id, &nodes, &self.dims)?;
        self.delivered += 1;
        Ok(out)
    }

    pub fn into_inner(self) -> P {
        self.post
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeStat {
    pub node_id: u32,
    pub rows: u32,
    pub channels: u32,
    pub cols: u32,
    /// Strongest dequantized activation and its flat index.
    pub max: f32,
    pub argmax: usize,
}

/// Model-agnostic post-processor: shape and peak activation per node.
#[derive(Debug, Default)]
pub struct NodeSummary;

impl PostProcess for NodeSummary {
    type Output = Vec<NodeStat>;

    fn process(
        &mut self,
        _model_id: u32,
        nodes: &[NodeView<'_>],
        _dims: &InputDims,
    ) -> Result<Self::Output> {
        Ok(nodes
            .iter()
            .map(|n| {
                let values = n.dequantize();
                let (argmax, max) = values
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, v)| {
                        if v > best.1 { (i, v) } else { best }
                    });
                NodeStat {
                    node_id: n.descriptor.node_id,
                    rows: n.rows(),
                    channels: n.channels(),
                    cols: n.cols(),
                    max,
                    argmax,
                }
            })
            .collect())
    }
}
