use anyhow::{Context, Result};

use npu_link::result;

use crate::cli::ParseOpts;

pub fn run(opts: ParseOpts) -> Result<()> {
    let raw = std::fs::read(&opts.file)
        .with_context(|| format!("reading {}", opts.file.display()))?;
    let nodes = result::parse(&raw).with_context(|| format!("parsing {}", opts.file.display()))?;
    println!("{} bytes, {} nodes", raw.len(), nodes.len());
    for n in &nodes {
        let d = &n.descriptor;
        let values = n.dequantize();
        let peak = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        println!(
            "node {} id={} ch={} rows={} cols={} (stride {}) offset={} len={} radix={} scale={} peak={:.4}",
            n.index,
            d.node_id,
            d.ch_length,
            d.row_length,
            d.col_length,
            d.aligned_cols(),
            n.offset,
            n.bytes.len(),
            d.output_radix,
            d.output_scale,
            peak
        );
    }
    Ok(())
}
