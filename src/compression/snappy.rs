// A small run-length codec standing in for Snappy: literal runs interleaved
// with (byte, count) runs. Effective on the repetitive data the wire layer
// actually sees (padded values, repeated keys); correct on arbitrary input.

use crate::error::{DbError, Result};

use super::varint;

const MIN_RUN: usize = 4;

pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    varint::write(&mut out, data.len() as u64);

    let mut i = 0usize;
    let n = data.len();
    let mut literal_start = 0usize;

    while i < n {
        let byte = data[i];
        let mut run_len = 1;
        while i + run_len < n && data[i + run_len] == byte {
            run_len += 1;
        }
        if run_len >= MIN_RUN {
            emit_literal(&mut out, &data[literal_start..i]);
            out.push(1);
            out.push(byte);
            varint::write(&mut out, run_len as u64);
            i += run_len;
            literal_start = i;
        } else {
            i += 1;
        }
    }
    emit_literal(&mut out, &data[literal_start..n]);
    out
}

fn emit_literal(out: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    out.push(0);
    varint::write(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0usize;
    let original_len = varint::read(data, &mut pos)
        .ok_or_else(|| DbError::Corruption("snappy: truncated length header".into()))? as usize;
    let mut out = Vec::with_capacity(original_len);

    while out.len() < original_len {
        let tag = *data
            .get(pos)
            .ok_or_else(|| DbError::Corruption("snappy: truncated stream".into()))?;
        pos += 1;
        match tag {
            0 => {
                let len = varint::read(data, &mut pos)
                    .ok_or_else(|| DbError::Corruption("snappy: truncated literal length".into()))?
                    as usize;
                let end = pos + len;
                let bytes = data
                    .get(pos..end)
                    .ok_or_else(|| DbError::Corruption("snappy: truncated literal body".into()))?;
                out.extend_from_slice(bytes);
                pos = end;
            }
            1 => {
                let byte = *data
                    .get(pos)
                    .ok_or_else(|| DbError::Corruption("snappy: truncated run byte".into()))?;
                pos += 1;
                let count = varint::read(data, &mut pos)
                    .ok_or_else(|| DbError::Corruption("snappy: truncated run length".into()))?
                    as usize;
                out.resize(out.len() + count, byte);
            }
            other => return Err(DbError::Corruption(format!("snappy: unknown tag {other}"))),
        }
    }
    Ok(out)
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
    fn round_trips_long_runs() {
        let data = vec![7u8; 10_000];
        let compressed = compress(&data);
        assert!(compressed.len() < data.len() / 10);
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn round_trips_empty_input() {
        assert_eq!(decompress(&compress(&[])).unwrap(), Vec::<u8>::new());
    }
}
