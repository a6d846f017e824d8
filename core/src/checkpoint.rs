//! Table checkpoint records.
//!
//! A checkpoint is a bare sequence of records, with no header or count:
//!
//! ```text
//! key      K::BYTES, little-endian
//! slot_id  K::BYTES, little-endian
//! vector   vec_size x f32, little-endian
//! ```
//!
//! The same byte stream is the interface to a host parameter server, scoped to
//! one table.

use crate::error::{EmbeddingError, Result};
use crate::types::{HashKey, SlotId};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord<K: HashKey> {
    pub key: K,
    pub slot_id: SlotId,
    pub vector: Vec<f32>,
}

/// Size in bytes of one record.
pub fn record_len<K: HashKey>(vec_size: usize) -> usize {
    2 * K::BYTES + vec_size * std::mem::size_of::<f32>()
}

/// Reads records until the stream ends or `max_records` have been read.
///
/// A stream that ends in the middle of a record is an
/// [`UnexpectedEof`](ErrorKind::UnexpectedEof) error.
pub fn read_records<K: HashKey, R: Read>(
    mut reader: R,
    vec_size: usize,
    max_records: Option<usize>,
) -> Result<Vec<CheckpointRecord<K>>> {
    let mut buf = vec![0u8; record_len::<K>(vec_size)];
    let mut records = Vec::new();
    while max_records.is_none_or(|max| records.len() < max) {
        if !fill_record(&mut reader, &mut buf)? {
            break;
        }
        records.push(decode_record(&buf, vec_size)?);
    }
    Ok(records)
}

/// Serialises every record into memory, then writes it with a single call.
pub fn write_records<K: HashKey, W: Write>(
    mut writer: W,
    records: &[CheckpointRecord<K>],
) -> Result<()> {
    let bytes = encode_records(records)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

pub fn encode_records<K: HashKey>(records: &[CheckpointRecord<K>]) -> Result<Vec<u8>> {
    let vec_size = records.first().map_or(0, |r| r.vector.len());
    let mut out = Vec::with_capacity(records.len() * record_len::<K>(vec_size));
    for record in records {
        if record.vector.len() != vec_size {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![vec_size],
                got: vec![record.vector.len()],
            });
        }
        let slot = K::from_u64(record.slot_id as u64).ok_or_else(|| {
            EmbeddingError::InvalidInput(format!(
                "slot id {} does not fit a {}-byte key",
                record.slot_id,
                K::BYTES
            ))
        })?;
        record.key.write_le(&mut out);
        slot.write_le(&mut out);
        for v in &record.vector {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    Ok(out)
}

pub fn load_records_from_file<K: HashKey, P: AsRef<Path>>(
    path: P,
    vec_size: usize,
    max_records: Option<usize>,
) -> Result<Vec<CheckpointRecord<K>>> {
    let file = File::open(path)?;
    read_records(std::io::BufReader::new(file), vec_size, max_records)
}

pub fn save_records_to_file<K: HashKey, P: AsRef<Path>>(
    path: P,
    records: &[CheckpointRecord<K>],
) -> Result<()> {
    let bytes = encode_records(records)?;
    let mut file = File::create(path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Fills `buf` completely. Returns `false` on a clean end of stream.
fn fill_record<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    match filled {
        0 => Ok(false),
        n if n == buf.len() => Ok(true),
        n => Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("truncated record: {n} of {} bytes", buf.len()),
        )
        .into()),
    }
}

fn decode_record<K: HashKey>(buf: &[u8], vec_size: usize) -> Result<CheckpointRecord<K>> {
    let corrupt = || EmbeddingError::InvalidInput("malformed checkpoint record".to_string());
    let (key_bytes, rest) = buf.split_at(K::BYTES);
    let (slot_bytes, vec_bytes) = rest.split_at(K::BYTES);
    let key = K::read_le(key_bytes).ok_or_else(corrupt)?;
    let slot = K::read_le(slot_bytes).ok_or_else(corrupt)?;
    let vector = vec_bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect::<Vec<_>>();
    if vector.len() != vec_size {
        return Err(corrupt());
    }
    let slot_id = usize::try_from(slot.as_u64()).map_err(|_| corrupt())?;
    Ok(CheckpointRecord {
        key,
        slot_id,
        vector,
    })
}
