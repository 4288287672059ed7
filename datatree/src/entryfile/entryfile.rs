//! The framed entry log.
//!
//! Each record on disk is:
//!
//! ```text
//! MagicBytes[8] | LengthNoHdr:u32 | body | Checksum:u32 | Padding
//! ```
//!
//! where `body` is the escaped form produced by `entry::escape_payload`
//! (magic-position list + payload), `LengthNoHdr` counts exactly the body,
//! the checksum is xxh32 over the body as stored, and zero padding brings the
//! whole frame to the next 8-byte boundary. Frames never straddle segment
//! files: the underlying [`HPFile`] pads a segment's tail with zeros instead,
//! and the readers here recognize such a zero gap and continue at the next
//! segment boundary.

use crate::def::{MAGIC_BYTES, MAX_ENTRY_BYTES};
use crate::entryfile::entry::{self, Entry};
use crate::error::{Result, TreeError};
use byteorder::{ByteOrder, LittleEndian};
use hpfile::{HPFile, PreReader};
use std::io;
use std::path::Path;
use std::sync::Arc;
use xxhash_rust::xxh32;

// magic + length field
const FRAME_HEAD: usize = 12;

/// Append-only log of framed entries on a head-prunable file.
pub struct EntryFile {
    pub hp_file: HPFile,
}

fn pad_len(body_len: usize) -> usize {
    (8 - (body_len & 7)) & 7
}

fn frame_len(body_len: usize) -> i64 {
    (FRAME_HEAD + body_len + 4 + pad_len(body_len)) as i64
}

impl EntryFile {
    pub fn new(buffer_size: i64, segment_size: i64, dir: impl AsRef<Path>) -> Result<EntryFile> {
        if segment_size % 8 != 0 {
            return Err(TreeError::bug("segment size must be 8-byte aligned"));
        }
        let hp_file = HPFile::new(buffer_size, segment_size, dir)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(EntryFile { hp_file })
    }

    /// Logical size including buffered bytes.
    pub fn size(&self) -> i64 {
        self.hp_file.size()
    }

    pub fn truncate(&self, size: i64) -> Result<()> {
        Ok(self.hp_file.truncate(size)?)
    }

    pub fn prune_head(&self, off: i64) -> Result<()> {
        Ok(self.hp_file.prune_head(off)?)
    }

    pub fn close(&self) {
        self.hp_file.close();
    }

    fn read_block(
        &self,
        buf: &mut [u8],
        off: i64,
        pre: Option<&mut PreReader>,
    ) -> io::Result<()> {
        match pre {
            Some(p) => self.hp_file.read_at_with_pre_reader(buf, off, p),
            None => self.hp_file.read_at(buf, off),
        }
    }

    // Locates the frame that a forward scanner expects at `off`, skipping the
    // zero gap left when a frame was bumped to the next segment. Returns the
    // real frame offset and the body length.
    fn read_head(&self, off: i64, mut pre: Option<&mut PreReader>) -> Result<(i64, usize)> {
        let seg = self.hp_file.segment_size();
        let mut off = off;
        let remaining = seg - off % seg;
        if remaining < FRAME_HEAD as i64 {
            off += remaining;
        }
        let mut head = [0u8; FRAME_HEAD];
        self.read_block(&mut head, off, pre.as_deref_mut())?;
        if head[..8] != MAGIC_BYTES {
            let in_tail = off % seg != 0;
            if in_tail && head[..8] == [0u8; 8] {
                off += seg - off % seg;
                self.read_block(&mut head, off, pre.as_deref_mut())?;
                if head[..8] != MAGIC_BYTES {
                    return Err(TreeError::corrupt("bad magic bytes", off));
                }
            } else {
                return Err(TreeError::corrupt("bad magic bytes", off));
            }
        }
        let len = LittleEndian::read_u32(&head[8..FRAME_HEAD]) as usize;
        if len >= MAX_ENTRY_BYTES {
            return Err(TreeError::corrupt("oversize entry length", off));
        }
        Ok((off, len))
    }

    /// Position right after the frame a scanner expects at `off`, reading
    /// only the frame head.
    pub fn skip_entry(&self, off: i64) -> Result<i64> {
        let (off, len) = self.read_head(off, None)?;
        Ok(off + frame_len(len))
    }

    fn read_entry_at(
        &self,
        off: i64,
        mut pre: Option<&mut PreReader>,
    ) -> Result<(Entry, Vec<i64>, i64)> {
        let (off, len) = self.read_head(off, pre.as_deref_mut())?;
        let mut b = vec![0u8; len + 4];
        self.read_block(&mut b, off + FRAME_HEAD as i64, pre)?;
        let stored = LittleEndian::read_u32(&b[len..]);
        if stored != xxh32::xxh32(&b[..len], 0) {
            return Err(TreeError::corrupt("entry checksum mismatch", off));
        }
        let (e, deact) = entry::entry_from_bytes(&b[..len])?;
        Ok((e, deact, off + frame_len(len)))
    }

    /// Reads and verifies the frame at `off`; returns the entry, its
    /// deactivated-serial-number list, and the offset right after the frame.
    pub fn read_entry(&self, off: i64) -> Result<(Entry, Vec<i64>, i64)> {
        self.read_entry_at(off, None)
    }

    /// [`EntryFile::read_entry`] for sequential scans: nearby frames are
    /// served from the pre-reader's cache window.
    pub fn read_entry_with_pre_reader(
        &self,
        off: i64,
        pre: &mut PreReader,
    ) -> Result<(Entry, Vec<i64>, i64)> {
        self.read_entry_at(off, Some(pre))
    }

    /// Appends an escaped body as one frame; returns its logical offset,
    /// which is always 8-byte aligned.
    pub fn append(&self, body: &[u8], buffer: &mut Vec<u8>) -> Result<i64> {
        if body.len() >= MAX_ENTRY_BYTES {
            return Err(TreeError::bug("entry exceeds the size limit"));
        }
        let mut frame = Vec::with_capacity(frame_len(body.len()) as usize);
        frame.extend_from_slice(&MAGIC_BYTES);
        let mut num = [0u8; 4];
        LittleEndian::write_u32(&mut num, body.len() as u32);
        frame.extend_from_slice(&num);
        frame.extend_from_slice(body);
        LittleEndian::write_u32(&mut num, xxh32::xxh32(body, 0));
        frame.extend_from_slice(&num);
        frame.resize(frame_len(body.len()) as usize, 0);
        let pos = self.hp_file.append(&frame, buffer)?;
        debug_assert!(pos % 8 == 0, "entries must stay 8-byte aligned");
        Ok(pos)
    }
}

/// Single-writer handle pairing the shared [`EntryFile`] with its buffer.
pub struct EntryFileWriter {
    pub entry_file: Arc<EntryFile>,
    wrbuf: Vec<u8>,
}

impl EntryFileWriter {
    pub fn new(entry_file: Arc<EntryFile>, buffer_size: usize) -> EntryFileWriter {
        EntryFileWriter {
            entry_file,
            wrbuf: Vec::with_capacity(buffer_size),
        }
    }

    pub fn append(&mut self, body: &[u8]) -> Result<i64> {
        self.entry_file.append(body, &mut self.wrbuf)
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.entry_file.hp_file.flush(&mut self.wrbuf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::MAGIC_BYTES;

    fn sample_entry(sn: i64) -> Entry {
        Entry {
            key: format!("key-{}", sn).into_bytes(),
            value: format!("value-{}", sn).into_bytes(),
            next_key: format!("key-{}", sn + 1).into_bytes(),
            height: sn / 10,
            last_height: -1,
            serial_num: sn,
        }
    }

    fn open(dir: &Path) -> EntryFile {
        EntryFile::new(512, 4096, dir).unwrap()
    }

    #[test]
    fn append_read_skip() {
        let tmp = tempfile::Builder::new().prefix("entryf").tempdir().unwrap();
        let ef = open(tmp.path());
        let mut buffer = Vec::new();

        let mut positions = Vec::new();
        for sn in 0..50i64 {
            let deact = if sn % 3 == 0 { vec![sn / 3] } else { vec![] };
            let body = entry::entry_to_bytes(&sample_entry(sn), &deact);
            let pos = ef.append(&body, &mut buffer).unwrap();
            assert_eq!(0, pos % 8);
            positions.push(pos);
        }
        ef.hp_file.flush(&mut buffer).unwrap();

        let mut pos = positions[0];
        for sn in 0..50i64 {
            assert!(pos <= positions[sn as usize]);
            let (e, deact, next) = ef.read_entry(pos).unwrap();
            assert_eq!(sample_entry(sn), e);
            if sn % 3 == 0 {
                assert_eq!(vec![sn / 3], deact);
            } else {
                assert!(deact.is_empty());
            }
            assert_eq!(next, ef.skip_entry(pos).unwrap());
            pos = next;
        }
    }

    #[test]
    fn scan_survives_segment_rollover() {
        let tmp = tempfile::Builder::new().prefix("entryf").tempdir().unwrap();
        let ef = open(tmp.path());
        let mut buffer = Vec::new();
        // entries big enough that a 4096-byte segment fits only a few
        let mut e = sample_entry(0);
        e.value = vec![0xab; 1000];
        let body = entry::entry_to_bytes(&e, &[]);
        let mut positions = Vec::new();
        for _ in 0..10 {
            positions.push(ef.append(&body, &mut buffer).unwrap());
        }
        ef.hp_file.flush(&mut buffer).unwrap();

        // walk with the scanner's expected offsets, not the real ones
        let mut pos = 0i64;
        let mut pre = PreReader::new();
        for real in positions {
            let (got, _, next) = ef.read_entry_with_pre_reader(pos, &mut pre).unwrap();
            assert!(pos <= real);
            assert_eq!(e, got);
            pos = next;
        }
        assert_eq!(pos, ef.size());
    }

    #[test]
    fn entry_with_embedded_magic_survives_disk() {
        let tmp = tempfile::Builder::new().prefix("entryf").tempdir().unwrap();
        let ef = open(tmp.path());
        let mut buffer = Vec::new();
        let mut e = sample_entry(1);
        e.value = MAGIC_BYTES.to_vec();
        let body = entry::entry_to_bytes(&e, &[]);
        let pos = ef.append(&body, &mut buffer).unwrap();
        ef.hp_file.flush(&mut buffer).unwrap();
        let (got, _, _) = ef.read_entry(pos).unwrap();
        assert_eq!(e, got);
    }

    #[test]
    fn corruption_is_fatal() {
        let tmp = tempfile::Builder::new().prefix("entryf").tempdir().unwrap();
        let ef = open(tmp.path());
        let mut buffer = Vec::new();
        let body = entry::entry_to_bytes(&sample_entry(7), &[]);
        let pos = ef.append(&body, &mut buffer).unwrap();
        ef.hp_file.flush(&mut buffer).unwrap();
        drop(ef);

        // flip one byte of the stored body
        let seg = tmp.path().join("0-4096");
        let mut raw = std::fs::read(&seg).unwrap();
        raw[FRAME_HEAD + 2] ^= 0xff;
        std::fs::write(&seg, &raw).unwrap();

        let ef = open(tmp.path());
        match ef.read_entry(pos) {
            Err(TreeError::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {:?}", other.map(|_| ())),
        }

        // and a broken magic marker
        let mut raw = std::fs::read(&seg).unwrap();
        raw[0] ^= 0xff;
        std::fs::write(&seg, &raw).unwrap();
        let ef = open(tmp.path());
        assert!(matches!(
            ef.read_entry(pos),
            Err(TreeError::Corrupt { .. })
        ));
    }
}
