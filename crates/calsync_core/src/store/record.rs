//! Log record framing.
//!
//! Each committed [`WriteBatch`] becomes one record:
//!
//! | field       | size | notes                          |
//! |-------------|------|--------------------------------|
//! | magic       | 4    | `CSLG`                         |
//! | version     | 2    | little-endian                  |
//! | payload_len | 4    | little-endian                  |
//! | payload     | n    | CBOR-encoded batch             |
//! | crc32       | 4    | over magic..payload, IEEE      |

use super::batch::WriteBatch;
use crate::error::{CoreError, CoreResult};

/// Magic bytes identifying a log record.
pub const RECORD_MAGIC: [u8; 4] = *b"CSLG";

/// Current record format version.
pub const RECORD_VERSION: u16 = 1;

/// magic (4) + version (2) + length (4)
pub(crate) const HEADER_SIZE: usize = 10;

const CRC_SIZE: usize = 4;

/// Frames a batch as a log record.
pub(crate) fn encode_record(batch: &WriteBatch, max_record_size: u32) -> CoreResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(batch, &mut payload).map_err(|e| CoreError::codec(e.to_string()))?;

    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= max_record_size)
        .ok_or_else(|| {
            CoreError::invalid_operation(format!(
                "batch of {} bytes exceeds the record limit of {max_record_size}",
                payload.len()
            ))
        })?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    buf.extend_from_slice(&RECORD_MAGIC);
    buf.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Outcome of reading one record from the log.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// A complete, verified record.
    Record {
        /// The decoded batch.
        batch: WriteBatch,
        /// Offset just past the record.
        next: usize,
    },
    /// The log ends with an incomplete record starting at this offset.
    TornTail,
    /// No bytes left.
    End,
}

/// Reads the record starting at `offset` in a fully-loaded log.
///
/// A record that runs past the end of the log, or the final record failing
/// its checksum, is a torn tail. Damage anywhere else is corruption.
pub(crate) fn read_record(log: &[u8], offset: usize, max_record_size: u32) -> CoreResult<ReadOutcome> {
    let remaining = log.len().saturating_sub(offset);
    if remaining == 0 {
        return Ok(ReadOutcome::End);
    }
    if remaining < HEADER_SIZE {
        return if RECORD_MAGIC.starts_with(&log[offset..offset + remaining.min(4)]) {
            Ok(ReadOutcome::TornTail)
        } else {
            Err(CoreError::corrupted(offset as u64, "invalid record magic"))
        };
    }

    let header = &log[offset..offset + HEADER_SIZE];
    if header[0..4] != RECORD_MAGIC {
        return Err(CoreError::corrupted(offset as u64, "invalid record magic"));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != RECORD_VERSION {
        return Err(CoreError::corrupted(
            offset as u64,
            format!("unsupported record version {version}"),
        ));
    }

    let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);
    if len > max_record_size {
        return Err(CoreError::corrupted(
            offset as u64,
            format!("record length {len} exceeds limit {max_record_size}"),
        ));
    }

    let total = HEADER_SIZE + len as usize + CRC_SIZE;
    if remaining < total {
        return Ok(ReadOutcome::TornTail);
    }

    let body_end = offset + HEADER_SIZE + len as usize;
    let stored_crc = u32::from_le_bytes([
        log[body_end],
        log[body_end + 1],
        log[body_end + 2],
        log[body_end + 3],
    ]);
    let next = offset + total;
    if compute_crc32(&log[offset..body_end]) != stored_crc {
        return if next == log.len() {
            Ok(ReadOutcome::TornTail)
        } else {
            Err(CoreError::corrupted(offset as u64, "checksum mismatch"))
        };
    }

    let batch: WriteBatch = ciborium::from_reader(&log[offset + HEADER_SIZE..body_end])
        .map_err(|e| CoreError::corrupted(offset as u64, format!("undecodable batch: {e}")))?;

    Ok(ReadOutcome::Record { batch, next })
}

/// Computes the IEEE CRC32 of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
