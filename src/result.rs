//! Raw inference result parsing.
//!
//! Layout:
//!
//! ```text
//! total_raw_len:u32 total_nodes:i32 node_descriptor[10] payload[..]
//! ```
//!
//! Node payloads follow the descriptor table back to back. Each occupies
//! `ch_length * row_length * round_up16(col_length)` bytes of int8 data, rows
//! padded to 16 columns.

use tracing::debug;

use crate::error::{LinkError, Result};
use crate::frame::{read_u32, write_u32};

pub const MAX_NODES: usize = 10;
pub const NODE_DESCRIPTOR_LEN: usize = 56;
/// Byte offset of the first node payload.
pub const RESULT_HEADER_LEN: usize = 8 + MAX_NODES * NODE_DESCRIPTOR_LEN;

const COL_ALIGN: u32 = 16;

pub fn round_up16(n: u32) -> u32 {
    n.saturating_add(COL_ALIGN - 1) & !(COL_ALIGN - 1)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeDescriptor {
    pub start_offset: u32,
    pub buf_len: u32,
    pub node_id: u32,
    pub supernum: u32,
    pub data_format: u32,
    pub row_start: u32,
    pub col_start: u32,
    pub ch_start: u32,
    pub row_length: u32,
    pub col_length: u32,
    pub ch_length: u32,
    pub output_index: u32,
    pub output_radix: u32,
    pub output_scale: f32,
}

impl NodeDescriptor {
    /// Descriptor with only the fields the host reads filled in.
    pub fn shaped(node_id: u32, rows: u32, channels: u32, cols: u32, radix: u32, scale: f32) -> Self {
        Self {
            node_id,
            output_index: node_id,
            row_length: rows,
            ch_length: channels,
            col_length: cols,
            output_radix: radix,
            output_scale: scale,
            ..Self::default()
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NODE_DESCRIPTOR_LEN {
            return Err(LinkError::truncated(
                "node descriptor",
                0,
                NODE_DESCRIPTOR_LEN,
                bytes.len(),
            ));
        }
        let w = |i: usize| read_u32(bytes, i * 4);
        Ok(Self {
            start_offset: w(0),
            buf_len: w(1),
            node_id: w(2),
            supernum: w(3),
            data_format: w(4),
            row_start: w(5),
            col_start: w(6),
            ch_start: w(7),
            row_length: w(8),
            col_length: w(9),
            ch_length: w(10),
            output_index: w(11),
            output_radix: w(12),
            output_scale: f32::from_bits(w(13)),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        for v in [
            self.start_offset,
            self.buf_len,
            self.node_id,
            self.supernum,
            self.data_format,
            self.row_start,
            self.col_start,
            self.ch_start,
            self.row_length,
            self.col_length,
            self.ch_length,
            self.output_index,
            self.output_radix,
            self.output_scale.to_bits(),
        ] {
            write_u32(out, v);
        }
    }

    pub fn aligned_cols(&self) -> u32 {
        round_up16(self.col_length)
    }

    /// Payload footprint including row padding. `None` if it overflows.
    pub fn byte_len(&self) -> Option<usize> {
        (self.ch_length as usize)
            .checked_mul(self.row_length as usize)?
            .checked_mul(self.aligned_cols() as usize)
    }

    /// Multiplier turning a raw int8 into a real value.
    pub fn dequant_factor(&self) -> f32 {
        let denom = self.output_scale * 2f32.powi(self.output_radix as i32);
        if denom == 0.0 { 0.0 } else { 1.0 / denom }
    }
}

/// One output node borrowed from a raw result buffer.
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    pub index: usize,
    pub descriptor: NodeDescriptor,
    /// Offset of `bytes` within the raw buffer.
    pub offset: usize,
    pub bytes: &'a [u8],
}

impl NodeView<'_> {
    pub fn rows(&self) -> u32 {
        self.descriptor.row_length
    }

    pub fn channels(&self) -> u32 {
        self.descriptor.ch_length
    }

    pub fn cols(&self) -> u32 {
        self.descriptor.col_length
    }

    /// Raw fixed-point value at (channel, row, col), skipping row padding.
    pub fn raw(&self, channel: u32, row: u32, col: u32) -> Option<i8> {
        let d = &self.descriptor;
        if channel >= d.ch_length || row >= d.row_length || col >= d.col_length {
            return None;
        }
        let line = channel as usize * d.row_length as usize + row as usize;
        let at = line * d.aligned_cols() as usize + col as usize;
        self.bytes.get(at).map(|&b| b as i8)
    }

    /// All real values, channel-major, padding dropped.
    pub fn dequantize(&self) -> Vec<f32> {
        let d = &self.descriptor;
        let factor = d.dequant_factor();
        let stride = d.aligned_cols() as usize;
        let cols = d.col_length as usize;
        self.bytes
            .chunks_exact(stride.max(1))
            .flat_map(|line| line[..cols.min(line.len())].iter())
            .map(|&b| (b as i8) as f32 * factor)
            .collect()
    }
}

/// Splits a raw result into per-node views without copying.
pub fn parse(buffer: &[u8]) -> Result<Vec<NodeView<'_>>> {
    if buffer.len() < RESULT_HEADER_LEN {
        return Err(LinkError::truncated(
            "descriptor table",
            0,
            RESULT_HEADER_LEN,
            buffer.len(),
        ));
    }
    let total_raw_len = read_u32(buffer, 0);
    let total_nodes = read_u32(buffer, 4) as i32;
    if total_nodes < 0 || total_nodes as usize > MAX_NODES {
        return Err(LinkError::NodeOverflow {
            count: total_nodes as i64,
            max: MAX_NODES,
        });
    }
    if total_raw_len as usize != buffer.len() {
        debug!(total_raw_len, actual = buffer.len(), "raw length header disagrees");
    }

    let mut views = Vec::with_capacity(total_nodes as usize);
    let mut offset = RESULT_HEADER_LEN;
    for index in 0..total_nodes as usize {
        let at = 8 + index * NODE_DESCRIPTOR_LEN;
        let descriptor = NodeDescriptor::parse(&buffer[at..at + NODE_DESCRIPTOR_LEN])?;
        let available = buffer.len() - offset;
        let needed = descriptor.byte_len().unwrap_or(usize::MAX);
        if needed > available {
            return Err(LinkError::truncated(
                format!("node {index}"),
                offset,
                needed,
                available,
            ));
        }
        views.push(NodeView {
            index,
            descriptor,
            offset,
            bytes: &buffer[offset..offset + needed],
        });
        offset += needed;
    }
    if offset != buffer.len() {
        return Err(LinkError::ResultLengthMismatch {
            accounted: offset,
            actual: buffer.len(),
        });
    }
    Ok(views)
}

/// Serializes nodes into the raw result layout. Offsets and lengths in the
/// descriptors are recomputed; each node's data is padded or cut to its
/// footprint.
pub fn encode(nodes: &[(NodeDescriptor, &[u8])]) -> Vec<u8> {
    let nodes = &nodes[..nodes.len().min(MAX_NODES)];
    let mut out = Vec::with_capacity(RESULT_HEADER_LEN);
    let mut payload = Vec::new();
    let mut table = Vec::with_capacity(MAX_NODES * NODE_DESCRIPTOR_LEN);
    for (descriptor, data) in nodes {
        let len = descriptor.byte_len().unwrap_or(0);
        let mut d = *descriptor;
        d.start_offset = (RESULT_HEADER_LEN + payload.len()) as u32;
        d.buf_len = len as u32;
        d.write(&mut table);
        let start = payload.len();
        payload.extend_from_slice(&data[..len.min(data.len())]);
        payload.resize(start + len, 0);
    }
    table.resize(MAX_NODES * NODE_DESCRIPTOR_LEN, 0);
    write_u32(&mut out, (RESULT_HEADER_LEN + payload.len()) as u32);
    write_u32(&mut out, nodes.len() as u32);
    out.extend_from_slice(&table);
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let a = NodeDescriptor::shaped(0, 2, 3, 5, 0, 1.0);
        let b = NodeDescriptor::shaped(1, 4, 1, 16, 1, 1.0);
        let c = NodeDescriptor::shaped(2, 1, 2, 17, 0, 1.0);
        encode(&[(a, &[1u8; 96][..]), (b, &[2u8; 64][..]), (c, &[3u8; 64][..])])
    }

    #[test]
    fn round_up_rule() {
        assert_eq!(round_up16(0), 0);
        assert_eq!(round_up16(1), 16);
        assert_eq!(round_up16(16), 16);
        assert_eq!(round_up16(17), 32);
        assert_eq!(RESULT_HEADER_LEN, 568);
    }

    #[test]
    fn parse_exact_buffer() {
        let buf = sample();
        assert_eq!(buf.len(), 568 + 96 + 64 + 64);
        let nodes = parse(&buf).unwrap();
        assert_eq!(nodes.len(), 3);
        let ranges: Vec<_> = nodes.iter().map(|n| (n.offset, n.bytes.len())).collect();
        assert_eq!(ranges, [(568, 96), (664, 64), (728, 64)]);
        assert!(nodes[1].bytes.iter().all(|&b| b == 2));
        assert_eq!(nodes[2].descriptor.start_offset, 728);
        assert_eq!(nodes[2].descriptor.buf_len, 64);
    }

    #[test]
    fn truncated_by_one_byte() {
        let buf = sample();
        let err = parse(&buf[..buf.len() - 1]).unwrap_err();
        assert!(
            matches!(err, LinkError::TruncatedResult { needed: 64, available: 63, .. }),
            "{err}"
        );
        assert!(err.is_result_local());
    }

    #[test]
    fn short_descriptor_table() {
        assert!(matches!(
            parse(&[0u8; 100]),
            Err(LinkError::TruncatedResult { needed: 568, .. })
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut buf = sample();
        buf.push(0);
        assert!(matches!(
            parse(&buf),
            Err(LinkError::ResultLengthMismatch {
                accounted: 792,
                actual: 793
            })
        ));
    }

    #[test]
    fn node_count_bounds() {
        let mut buf = sample();
        buf[4..8].copy_from_slice(&11u32.to_le_bytes());
        assert!(matches!(parse(&buf), Err(LinkError::NodeOverflow { count: 11, .. })));
        buf[4..8].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(parse(&buf), Err(LinkError::NodeOverflow { count: -1, .. })));
    }

    #[test]
    fn huge_dimensions_do_not_overflow() {
        let d = NodeDescriptor::shaped(0, u32::MAX, u32::MAX, u32::MAX, 0, 1.0);
        let buf = encode(&[(d, &[][..])]);
        // footprint overflows or exceeds the buffer; either way no panic
        assert!(parse(&buf).is_err());
    }

    #[test]
    fn dequantize_skips_padding() {
        let d = NodeDescriptor::shaped(0, 1, 2, 3, 1, 0.5);
        let mut data = vec![0u8; 32];
        data[..3].copy_from_slice(&[2, 4, (-6i8) as u8]);
        data[3] = 99; // padding
        data[16..19].copy_from_slice(&[1, 1, 1]);
        let buf = encode(&[(d, &data[..])]);
        let nodes = parse(&buf).unwrap();
        // factor = 1 / (0.5 * 2^1) = 1
        assert_eq!(nodes[0].dequantize(), [2.0, 4.0, -6.0, 1.0, 1.0, 1.0]);
        assert_eq!(nodes[0].raw(0, 0, 2), Some(-6));
        assert_eq!(nodes[0].raw(1, 0, 0), Some(1));
        assert_eq!(nodes[0].raw(0, 0, 3), None);
    }
}
