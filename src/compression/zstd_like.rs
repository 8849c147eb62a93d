// A small move-to-front + run-length codec standing in for Zstd. MTF turns
// locally repetitive byte streams into runs of small indices (mostly zero),
// which the RLE stage then collapses; together they approximate the kind of
// entropy reduction a real dictionary/entropy coder gets from Zstd, without
// reimplementing its frame format.

use crate::error::{DbError, Result};

use super::varint;

fn mtf_encode(data: &[u8]) -> Vec<u8> {
    let mut table: Vec<u8> = (0..=255u8).collect();
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        let idx = table.iter().position(|&b| b == byte).expect("table covers all bytes");
        out.push(idx as u8);
        table.remove(idx);
        table.insert(0, byte);
    }
    out
}

fn mtf_decode(indices: &[u8]) -> Vec<u8> {
    let mut table: Vec<u8> = (0..=255u8).collect();
    let mut out = Vec::with_capacity(indices.len());
    for &idx in indices {
        let byte = table[idx as usize];
        out.push(byte);
        table.remove(idx as usize);
        table.insert(0, byte);
    }
    out
}

const MIN_RUN: usize = 3;

fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < data.len() {
        let byte = data[i];
        let mut run_len = 1;
        while i + run_len < data.len() && data[i + run_len] == byte {
            run_len += 1;
        }
        if run_len >= MIN_RUN {
            out.push(1);
            out.push(byte);
            varint::write(&mut out, run_len as u64);
        } else {
            for _ in 0..run_len {
                out.push(0);
                out.push(byte);
            }
        }
        i += run_len;
    }
    out
}

fn rle_decode(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let tag = data[pos];
        pos += 1;
        match tag {
            0 => {
                let byte = *data
                    .get(pos)
                    .ok_or_else(|| DbError::Corruption("zstd_like: truncated literal".into()))?;
                pos += 1;
                out.push(byte);
            }
            1 => {
                let byte = *data
                    .get(pos)
                    .ok_or_else(|| DbError::Corruption("zstd_like: truncated run byte".into()))?;
                pos += 1;
                let count = varint::read(data, &mut pos)
                    .ok_or_else(|| DbError::Corruption("zstd_like: truncated run length".into()))?
                    as usize;
                out.resize(out.len() + count, byte);
            }
            other => return Err(DbError::Corruption(format!("zstd_like: unknown tag {other}"))),
        }
    }
    Ok(out)
}

pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    varint::write(&mut out, data.len() as u64);
    let transformed = mtf_encode(data);
    let encoded = rle_encode(&transformed);
    out.extend_from_slice(&encoded);
    out
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0usize;
    let original_len = varint::read(data, &mut pos)
        .ok_or_else(|| DbError::Corruption("zstd_like: truncated length header".into()))? as usize;
    let transformed = rle_decode(&data[pos..])?;
    if transformed.len() != original_len {
        return Err(DbError::Corruption("zstd_like: length mismatch after RLE decode".into()));
    }
    Ok(mtf_decode(&transformed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_repetitive_text() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(16);
        let compressed = compress(&data);
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn round_trips_empty_input() {
        assert_eq!(decompress(&compress(&[])).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn mtf_round_trips_directly() {
        let data = b"mississippi".to_vec();
        assert_eq!(mtf_decode(&mtf_encode(&data)), data);
    }
}
