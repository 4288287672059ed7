//! The entry record and its payload serialization.
//!
//! An entry's payload is what gets hashed into the tree:
//!
//! ```text
//! KeyLen:u32  Key        ValLen:u32 Val      NxtLen:u32 NextKey
//! Height:i64  LastHeight:i64  SerialNum:i64
//! DeactSN:u64 ...  terminator 0xFFFF_FFFF_FFFF_FFFF
//! ```
//!
//! Before the payload goes to disk it is escaped: any embedded copy of the
//! frame marker [`MAGIC_BYTES`] is zeroed out and its position recorded in a
//! leading position list, so a scanner can never mistake payload bytes for a
//! frame start. [`entry_to_bytes`]/[`entry_from_bytes`] convert between an
//! entry and this escaped body (position list + payload); the frame wrapper
//! around the body is the entry file's business.

use crate::def::{DEACT_SN_END, MAGIC_BYTES, MAGIC_POS_END, MAX_ENTRY_BYTES, NULL_SERIAL_NUM};
use crate::error::{Result, TreeError};
use crate::utils::hasher::{self, Hash32};
use byteorder::{ByteOrder, LittleEndian};

/// One logical record of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub next_key: Vec<u8>,
    pub height: i64,
    pub last_height: i64,
    pub serial_num: i64,
}

impl Entry {
    /// The null entry: hash padding for leaves that were never written. It is
    /// not stored on disk.
    pub fn null() -> Entry {
        Entry {
            key: Vec::new(),
            value: Vec::new(),
            next_key: Vec::new(),
            height: -1,
            last_height: -1,
            serial_num: NULL_SERIAL_NUM,
        }
    }

    /// Filler entries are synthesized to flush pending deactivations; they
    /// carry real serial numbers but never own an active bit.
    pub fn is_filler(&self) -> bool {
        self.key.is_empty() && self.value.is_empty() && self.next_key.is_empty()
    }

    /// Serialized payload length including the deactivated-list terminator.
    pub fn payload_len(&self, deactived_count: usize) -> usize {
        4 * 3 + self.key.len() + self.value.len() + self.next_key.len()
            + 8 * 3
            + 8 * (deactived_count + 1)
    }

    /// Serializes the payload (the hashed domain of the entry).
    pub fn payload_to_bytes(&self, deactived_sn_list: &[i64]) -> Vec<u8> {
        let mut b = Vec::with_capacity(self.payload_len(deactived_sn_list.len()));
        for blob in [&self.key, &self.value, &self.next_key] {
            let mut len = [0u8; 4];
            LittleEndian::write_u32(&mut len, blob.len() as u32);
            b.extend_from_slice(&len);
            b.extend_from_slice(blob);
        }
        let mut num = [0u8; 8];
        for v in [self.height, self.last_height, self.serial_num] {
            LittleEndian::write_i64(&mut num, v);
            b.extend_from_slice(&num);
        }
        for &sn in deactived_sn_list {
            LittleEndian::write_u64(&mut num, sn as u64);
            b.extend_from_slice(&num);
        }
        LittleEndian::write_u64(&mut num, DEACT_SN_END);
        b.extend_from_slice(&num);
        b
    }

    /// Leaf hash of this entry: plain SHA-256 over the payload.
    pub fn hash(&self, deactived_sn_list: &[i64]) -> Hash32 {
        hasher::hash(self.payload_to_bytes(deactived_sn_list))
    }
}

/// Parses a payload produced by [`Entry::payload_to_bytes`].
pub fn payload_from_bytes(b: &[u8]) -> Result<(Entry, Vec<i64>)> {
    let mut rd = Reader { b, i: 0 };
    let key = rd.blob()?;
    let value = rd.blob()?;
    let next_key = rd.blob()?;
    let height = rd.i64()?;
    let last_height = rd.i64()?;
    let serial_num = rd.i64()?;
    let mut deactived = Vec::new();
    loop {
        let sn = rd.i64()? as u64;
        if sn == DEACT_SN_END {
            break;
        }
        deactived.push(sn as i64);
    }
    Ok((
        Entry {
            key,
            value,
            next_key,
            height,
            last_height,
            serial_num,
        },
        deactived,
    ))
}

struct Reader<'a> {
    b: &'a [u8],
    i: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.i + n > self.b.len() {
            return Err(TreeError::corrupt("truncated entry payload", self.i as i64));
        }
        let s = &self.b[self.i..self.i + n];
        self.i += n;
        Ok(s)
    }

    fn blob(&mut self) -> Result<Vec<u8>> {
        let len = LittleEndian::read_u32(self.take(4)?) as usize;
        if len >= MAX_ENTRY_BYTES {
            return Err(TreeError::corrupt("oversize blob in entry", self.i as i64));
        }
        Ok(self.take(len)?.to_vec())
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }
}

// Non-overlapping occurrences of MAGIC_BYTES within `payload`.
fn find_magic_positions(payload: &[u8]) -> Vec<usize> {
    let mut res = Vec::new();
    let mut i = 0;
    while i + 8 <= payload.len() {
        if payload[i..i + 8] == MAGIC_BYTES {
            res.push(i);
            i += 8;
        } else {
            i += 1;
        }
    }
    res
}

/// Escapes a payload into the on-disk body: position list (terminated by
/// [`MAGIC_POS_END`]) followed by the payload with every embedded magic
/// marker zeroed out. Positions are relative to the start of the body.
pub fn escape_payload(payload: Vec<u8>) -> Vec<u8> {
    let hits = find_magic_positions(&payload);
    let base = 4 * (hits.len() + 1);
    let mut b = Vec::with_capacity(base + payload.len());
    let mut num = [0u8; 4];
    for &h in &hits {
        LittleEndian::write_u32(&mut num, (base + h) as u32);
        b.extend_from_slice(&num);
    }
    LittleEndian::write_u32(&mut num, MAGIC_POS_END);
    b.extend_from_slice(&num);
    b.extend_from_slice(&payload);
    for &h in &hits {
        b[base + h..base + h + 8].fill(0);
    }
    b
}

/// Serializes an entry plus its deactivated-serial-number list into the
/// escaped on-disk body.
pub fn entry_to_bytes(entry: &Entry, deactived_sn_list: &[i64]) -> Vec<u8> {
    escape_payload(entry.payload_to_bytes(deactived_sn_list))
}

/// Parses an escaped body back into the entry and its deactivated list.
pub fn entry_from_bytes(b: &[u8]) -> Result<(Entry, Vec<i64>)> {
    let mut positions = Vec::new();
    let mut i = 0;
    loop {
        if i + 4 > b.len() {
            return Err(TreeError::corrupt("unterminated magic-position list", i as i64));
        }
        let p = LittleEndian::read_u32(&b[i..i + 4]);
        i += 4;
        if p == MAGIC_POS_END {
            break;
        }
        positions.push(p as usize);
    }
    let mut owned = b.to_vec();
    for &p in &positions {
        if p < i || p + 8 > owned.len() {
            return Err(TreeError::corrupt("escape position out of range", p as i64));
        }
        owned[p..p + 8].copy_from_slice(&MAGIC_BYTES);
    }
    payload_from_bytes(&owned[i..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entry {
        Entry {
            key: b"a".to_vec(),
            value: b"b".to_vec(),
            next_key: b"c".to_vec(),
            height: 1,
            last_height: 0,
            serial_num: 0,
        }
    }

    fn magic_position_count(body: &[u8]) -> usize {
        let mut n = 0;
        let mut i = 0;
        while LittleEndian::read_u32(&body[i..i + 4]) != MAGIC_POS_END {
            n += 1;
            i += 4;
        }
        n
    }

    #[test]
    fn round_trip_without_collision() {
        let e = sample();
        let body = entry_to_bytes(&e, &[]);
        assert_eq!(0, magic_position_count(&body));
        let (got, deact) = entry_from_bytes(&body).unwrap();
        assert_eq!(e, got);
        assert!(deact.is_empty());
    }

    #[test]
    fn round_trip_with_single_collision() {
        let mut e = sample();
        e.value = MAGIC_BYTES.to_vec();
        let body = entry_to_bytes(&e, &[7, 8]);
        assert_eq!(1, magic_position_count(&body));
        assert!(!body.windows(8).any(|w| w == MAGIC_BYTES));
        let (got, deact) = entry_from_bytes(&body).unwrap();
        assert_eq!(e, got);
        assert_eq!(vec![7, 8], deact);
    }

    #[test]
    fn round_trip_with_many_collisions() {
        // up to 16 embedded copies, some back to back
        for k in 1..=16usize {
            let mut e = sample();
            e.key = MAGIC_BYTES.repeat(k);
            e.value = b"xILOVEYOUx".to_vec(); // offset copy inside value too
            let body = entry_to_bytes(&e, &[1]);
            assert_eq!(k + 1, magic_position_count(&body));
            assert!(!body.windows(8).any(|w| w == MAGIC_BYTES));
            let (got, deact) = entry_from_bytes(&body).unwrap();
            assert_eq!(e, got);
            assert_eq!(vec![1], deact);
        }
    }

    #[test]
    fn hash_covers_deactivation_list() {
        let e = sample();
        assert_ne!(e.hash(&[]), e.hash(&[1]));
        assert_eq!(e.hash(&[1]), e.hash(&[1]));
    }

    #[test]
    fn null_entry_is_filler() {
        let e = Entry::null();
        assert!(e.is_filler());
        assert_eq!(e.serial_num, NULL_SERIAL_NUM);
        let body = entry_to_bytes(&e, &[]);
        let (got, _) = entry_from_bytes(&body).unwrap();
        assert_eq!(e, got);
    }

    #[test]
    fn corrupt_bodies_are_rejected() {
        let e = sample();
        let body = entry_to_bytes(&e, &[]);
        // chop off the payload tail
        assert!(entry_from_bytes(&body[..body.len() - 4]).is_err());
        // a position pointing outside the body
        let mut bad = body.clone();
        LittleEndian::write_u32(&mut bad[0..4], (body.len() + 100) as u32);
        assert!(entry_from_bytes(&bad).is_err());
    }
}
