//! rle64 tile-bit codec.
//!
//! A tile's 4096 bit-cells are encoded as a stream of (run_length, value)
//! byte pairs, run_length in [1,255] and value in {0,1}, then base64'd
//! (standard alphabet). Runs longer than 255 split into multiple pairs.
//! The text form is what goes into persisted snapshots and onto the wire.

use anyhow::{Result, bail, ensure};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::domain::TILE_CELL_COUNT;

/// Encode tile bits (one byte per cell, each 0 or 1) to rle64 text.
///
/// Panics in debug builds when handed a non-bit value; release builds
/// normalize anything non-zero to 1.
pub fn encode_rle64(bits: &[u8]) -> String {
    let mut pairs = Vec::with_capacity(64);
    let mut iter = bits.iter().map(|&b| {
        debug_assert!(b <= 1, "cell value out of domain: {b}");
        u8::from(b != 0)
    });
    if let Some(first) = iter.next() {
        let mut run_value = first;
        let mut run_len: u32 = 1;
        for v in iter {
            if v == run_value && run_len < 255 {
                run_len += 1;
            } else {
                pairs.push(run_len as u8);
                pairs.push(run_value);
                run_value = v;
                run_len = 1;
            }
        }
        pairs.push(run_len as u8);
        pairs.push(run_value);
    }
    BASE64.encode(&pairs)
}

/// Decode rle64 text back to exactly TILE_CELL_COUNT cell bytes.
///
/// Rejects bad base64, odd pair streams, zero-length runs, non-bit values,
/// and any total other than the exact cell count.
pub fn decode_rle64(text: &str) -> Result<Vec<u8>> {
    let raw = BASE64
        .decode(text)
        .map_err(|e| anyhow::anyhow!("bad rle64 base64: {e}"))?;
    ensure!(raw.len() % 2 == 0, "rle64 stream has odd byte count");
    let mut bits = Vec::with_capacity(TILE_CELL_COUNT);
    for pair in raw.chunks_exact(2) {
        let (run_len, value) = (pair[0], pair[1]);
        ensure!(run_len >= 1, "rle64 zero-length run");
        ensure!(value <= 1, "rle64 value out of domain: {value}");
        if bits.len() + run_len as usize > TILE_CELL_COUNT {
            bail!("rle64 stream overruns cell count");
        }
        bits.resize(bits.len() + run_len as usize, value);
    }
    ensure!(
        bits.len() == TILE_CELL_COUNT,
        "rle64 stream decodes to {} cells, expected {TILE_CELL_COUNT}",
        bits.len()
    );
    Ok(bits)
}
