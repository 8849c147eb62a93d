// Batch compressor: accumulates small records, compresses the whole framed
// batch as one block. Wire format: `[count:u32][(len:u32, record)*]`,
// compressed as a unit under the configured algorithm.

use crate::error::{DbError, Result};

use super::{compress, decompress, CompressionAlgorithm};

pub fn compress_batch(algo: CompressionAlgorithm, records: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut framed = Vec::new();
    framed.extend_from_slice(&(records.len() as u32).to_be_bytes());
    for record in records {
        framed.extend_from_slice(&(record.len() as u32).to_be_bytes());
        framed.extend_from_slice(record);
    }
    compress(algo, &framed)
}

pub fn decompress_batch(algo: CompressionAlgorithm, data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let framed = decompress(algo, data)?;
    if framed.len() < 4 {
        return Err(DbError::Corruption("batch: truncated count header".into()));
    }
    let count = u32::from_be_bytes(framed[0..4].try_into().unwrap()) as usize;
    let mut pos = 4usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        if framed.len() < pos + 4 {
            return Err(DbError::Corruption("batch: truncated record length".into()));
        }
        let len = u32::from_be_bytes(framed[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if framed.len() < pos + len {
            return Err(DbError::Corruption("batch: truncated record body".into()));
        }
        out.push(framed[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_round_trips_across_algorithms() {
        let records = vec![b"alpha".to_vec(), b"beta".to_vec(), Vec::new(), b"gamma-gamma-gamma".to_vec()];
        for algo in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Snappy,
            CompressionAlgorithm::Zstd,
        ] {
            let compressed = compress_batch(algo, &records).unwrap();
            let decompressed = decompress_batch(algo, &compressed).unwrap();
            assert_eq!(decompressed, records);
        }
    }
}
