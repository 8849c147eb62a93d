// A small LZ77-style codec in the spirit of LZ4: a hash table over 4-byte
// prefixes finds back-references, literal runs fill the gaps. Not
// block/frame-compatible with the real LZ4 format, just a correct,
// self-contained stand-in for it.

use std::collections::HashMap;

use crate::error::{DbError, Result};

use super::varint;

const MIN_MATCH: usize = 4;

pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    varint::write(&mut out, data.len() as u64);

    let mut hash_table: HashMap<[u8; 4], usize> = HashMap::new();
    let mut literal_start = 0usize;
    let mut i = 0usize;
    let n = data.len();

    while i < n {
        if i + MIN_MATCH <= n {
            let key: [u8; 4] = data[i..i + MIN_MATCH].try_into().unwrap();
            if let Some(&match_pos) = hash_table.get(&key) {
                let mut match_len = 0usize;
                while i + match_len < n && data[match_pos + match_len] == data[i + match_len] {
                    match_len += 1;
                }
                if match_len >= MIN_MATCH {
                    emit_literal(&mut out, &data[literal_start..i]);
                    out.push(1);
                    varint::write(&mut out, match_len as u64);
                    varint::write(&mut out, (i - match_pos) as u64);
                    hash_table.insert(key, i);
                    i += match_len;
                    literal_start = i;
                    continue;
                }
            }
            hash_table.insert(key, i);
        }
        i += 1;
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
        .ok_or_else(|| DbError::Corruption("lz4: truncated length header".into()))? as usize;
    let mut out = Vec::with_capacity(original_len);

    while out.len() < original_len {
        let tag = *data
            .get(pos)
            .ok_or_else(|| DbError::Corruption("lz4: truncated stream".into()))?;
        pos += 1;
        match tag {
            0 => {
                let len = varint::read(data, &mut pos)
                    .ok_or_else(|| DbError::Corruption("lz4: truncated literal length".into()))?
                    as usize;
                let end = pos + len;
                let bytes = data
                    .get(pos..end)
                    .ok_or_else(|| DbError::Corruption("lz4: truncated literal body".into()))?;
                out.extend_from_slice(bytes);
                pos = end;
            }
            1 => {
                let match_len = varint::read(data, &mut pos)
                    .ok_or_else(|| DbError::Corruption("lz4: truncated match length".into()))?
                    as usize;
                let offset = varint::read(data, &mut pos)
                    .ok_or_else(|| DbError::Corruption("lz4: truncated match offset".into()))?
                    as usize;
                if offset == 0 || offset > out.len() {
                    return Err(DbError::Corruption("lz4: match offset out of range".into()));
                }
                let start = out.len() - offset;
                for k in 0..match_len {
                    let byte = out[start + k];
                    out.push(byte);
                }
            }
            other => return Err(DbError::Corruption(format!("lz4: unknown tag {other}"))),
        }
    }
    Ok(out)
}
