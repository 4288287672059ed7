//! # Head-prunable file
//!
//! An ordinary file cannot be truncated from its beginning. A [`HPFile`]
//! simulates one large append-only file with a sequence of fixed-size segment
//! files inside a directory, so pruning the head is just deleting the leading
//! segment files. The logical offset space is never renumbered: offsets below
//! the prune point simply become unreadable.
//!
//! A byteslice passed to [`HPFile::append`] is stored as an indivisible unit.
//! If it does not fit into what remains of the current segment, the segment is
//! zero-padded to its nominal size and the slice starts a fresh segment, so no
//! unit ever straddles a segment boundary. `append` returns the logical offset
//! where the slice actually begins; hand that same offset to
//! [`HPFile::read_at`] later.
//!
//! One writer thread, many reader threads. The write buffer is owned by the
//! writer and passed into `append`/`flush`, which keeps `HPFile` itself
//! shareable behind an `Arc` without a lock on the read path. Readers that
//! scan sequentially can amortize syscalls with a [`PreReader`].

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Size of a [`PreReader`]'s cache window.
const PRE_READ_BUF_SIZE: usize = 256 * 1024;

/// Head-prunable file: one logical append-only stream over segment files.
#[derive(Debug)]
pub struct HPFile {
    dir: PathBuf,
    segment_size: i64,
    buffer_size: i64,
    // segment id -> opened file; only the largest id is ever written
    segments: DashMap<i64, Arc<File>>,
    largest_id: AtomicI64,
    // bytes in the largest segment, including not-yet-flushed ones
    tail_size: AtomicI64,
    file_size: AtomicI64,
    file_size_on_disk: AtomicI64,
}

impl HPFile {
    /// Opens (or creates) a `HPFile` in `dir`. A directory that already holds
    /// segment files must have been written with the same `segment_size`.
    ///
    /// `buffer_size` bounds the write buffer handed to `append`/`flush`;
    /// `segment_size` must be a positive multiple of it.
    pub fn new(buffer_size: i64, segment_size: i64, dir: impl AsRef<Path>) -> Result<HPFile> {
        if buffer_size <= 0 || segment_size % buffer_size != 0 {
            return Err(anyhow!(
                "segment size {} is not a multiple of buffer size {}",
                segment_size,
                buffer_size
            ));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            ids.push(Self::parse_segment_name(segment_size, &name)?);
        }
        let largest_id = ids.iter().copied().max().unwrap_or(0);

        let segments = DashMap::new();
        let mut tail_size = 0;
        for &id in &ids {
            let path = Self::segment_path(&dir, id, segment_size);
            let file = File::options()
                .read(true)
                .write(id == largest_id)
                .open(&path)?;
            if id == largest_id {
                tail_size = file.metadata()?.len() as i64;
            }
            segments.insert(id, Arc::new(file));
        }
        if ids.is_empty() {
            let path = Self::segment_path(&dir, 0, segment_size);
            segments.insert(0, Arc::new(File::create_new(path)?));
        }

        let file_size = largest_id * segment_size + tail_size;
        Ok(HPFile {
            dir,
            segment_size,
            buffer_size,
            segments,
            largest_id: AtomicI64::new(largest_id),
            tail_size: AtomicI64::new(tail_size),
            file_size: AtomicI64::new(file_size),
            file_size_on_disk: AtomicI64::new(file_size),
        })
    }

    fn segment_path(dir: &Path, id: i64, segment_size: i64) -> PathBuf {
        dir.join(format!("{}-{}", id, segment_size))
    }

    fn parse_segment_name(segment_size: i64, name: &str) -> Result<i64> {
        let (id, size) = name
            .split_once('-')
            .ok_or_else(|| anyhow!("{} does not match the pattern 'id-segmentSize'", name))?;
        let id: i64 = id.parse()?;
        let size: i64 = size.parse()?;
        if size != segment_size {
            return Err(anyhow!("segment size mismatch: {} != {}", size, segment_size));
        }
        Ok(id)
    }

    /// Segment size this file was opened with.
    pub fn segment_size(&self) -> i64 {
        self.segment_size
    }

    /// Logical size, including bytes still sitting in the write buffer.
    pub fn size(&self) -> i64 {
        self.file_size.load(Ordering::SeqCst)
    }

    /// Logical size of what has reached the file system.
    pub fn size_on_disk(&self) -> i64 {
        self.file_size_on_disk.load(Ordering::SeqCst)
    }

    /// Logical offset of the first byte that is still on disk. Everything
    /// below it has been discarded by [`HPFile::prune_head`].
    pub fn head_offset(&self) -> i64 {
        let smallest = self
            .segments
            .iter()
            .map(|e| *e.key())
            .min()
            .unwrap_or_else(|| self.largest_id.load(Ordering::SeqCst));
        smallest * self.segment_size
    }

    fn tail_file(&self) -> io::Result<Arc<File>> {
        let id = self.largest_id.load(Ordering::SeqCst);
        match self.segments.get(&id) {
            Some(f) => Ok(f.clone()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("segment {} is missing", id),
            )),
        }
    }

    /// Writes out the buffered bytes and calls `sync_all` on the tail segment.
    pub fn flush(&self, buffer: &mut Vec<u8>) -> io::Result<()> {
        self.write_out(buffer)?;
        self.tail_file()?.sync_all()
    }

    fn write_out(&self, buffer: &mut Vec<u8>) -> io::Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let f = self.tail_file()?;
        (&*f).seek(SeekFrom::End(0))?;
        (&*f).write_all(buffer)?;
        self.file_size_on_disk
            .fetch_add(buffer.len() as i64, Ordering::SeqCst);
        buffer.clear();
        Ok(())
    }

    // Stages `bz` for the tail segment; the caller has made sure it fits.
    fn stage(&self, bz: &[u8], buffer: &mut Vec<u8>) -> io::Result<()> {
        if (buffer.len() + bz.len()) as i64 > self.buffer_size {
            self.write_out(buffer)?;
        }
        if bz.len() as i64 >= self.buffer_size {
            // too big for the buffer, write through
            let f = self.tail_file()?;
            (&*f).seek(SeekFrom::End(0))?;
            (&*f).write_all(bz)?;
            self.file_size_on_disk
                .fetch_add(bz.len() as i64, Ordering::SeqCst);
        } else {
            buffer.extend_from_slice(bz);
        }
        self.tail_size.fetch_add(bz.len() as i64, Ordering::SeqCst);
        self.file_size.fetch_add(bz.len() as i64, Ordering::SeqCst);
        Ok(())
    }

    fn start_new_segment(&self, buffer: &mut Vec<u8>) -> io::Result<()> {
        self.write_out(buffer)?;
        let id = self.largest_id.load(Ordering::SeqCst) + 1;
        let path = Self::segment_path(&self.dir, id, self.segment_size);
        let file = match File::create_new(&path) {
            Ok(f) => f,
            Err(_) => File::options().read(true).write(true).open(&path)?,
        };
        self.segments.insert(id, Arc::new(file));
        self.largest_id.store(id, Ordering::SeqCst);
        self.tail_size.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Appends `bz` as one indivisible unit and returns the logical offset
    /// where it begins. When `bz` does not fit into the current segment, the
    /// segment is zero-padded to `segment_size` first, so the returned offset
    /// may be larger than the size before the call.
    pub fn append(&self, bz: &[u8], buffer: &mut Vec<u8>) -> io::Result<i64> {
        if bz.len() as i64 > self.segment_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("slice of {} bytes exceeds segment size", bz.len()),
            ));
        }
        let tail = self.tail_size.load(Ordering::SeqCst);
        if tail + bz.len() as i64 > self.segment_size {
            let padding = vec![0u8; (self.segment_size - tail) as usize];
            self.stage(&padding, buffer)?;
            self.start_new_segment(buffer)?;
        }
        let start = self.size();
        self.stage(bz, buffer)?;
        Ok(start)
    }

    /// Fills `buf` from the flushed part of the file at `offset`. The range
    /// must lie inside one segment, which holds for any range within a unit
    /// written by a single `append` call.
    pub fn read_at(&self, buf: &mut [u8], offset: i64) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = offset + buf.len() as i64;
        if end > self.size_on_disk() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read past flushed end: {} > {}", end, self.size_on_disk()),
            ));
        }
        let id = offset / self.segment_size;
        let pos = offset % self.segment_size;
        if pos + buf.len() as i64 > self.segment_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read range straddles a segment boundary",
            ));
        }
        let f = match self.segments.get(&id) {
            Some(f) => f.clone(),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("segment {} was pruned or never written", id),
                ));
            }
        };
        read_exact_at(&f, buf, pos as u64)
    }

    /// Like [`HPFile::read_at`], but serves repeated nearby reads from the
    /// `pre_reader`'s cache window, refilling it with one large read when the
    /// wanted range falls outside.
    pub fn read_at_with_pre_reader(
        &self,
        buf: &mut [u8],
        offset: i64,
        pre_reader: &mut PreReader,
    ) -> io::Result<()> {
        if buf.len() >= PRE_READ_BUF_SIZE {
            return self.read_at(buf, offset);
        }
        if pre_reader.try_read(offset, buf) {
            return Ok(());
        }
        let id = offset / self.segment_size;
        let pos = offset % self.segment_size;
        let seg_left = self.segment_size - pos;
        let disk_left = self.size_on_disk() - offset;
        let fill = (PRE_READ_BUF_SIZE as i64).min(seg_left).min(disk_left);
        if fill < buf.len() as i64 {
            return self.read_at(buf, offset);
        }
        let f = match self.segments.get(&id) {
            Some(f) => f.clone(),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("segment {} was pruned or never written", id),
                ));
            }
        };
        pre_reader.fill(offset, fill as usize, |slice| {
            read_exact_at(&f, slice, pos as u64)
        })?;
        if !pre_reader.try_read(offset, buf) {
            unreachable!("pre-reader lost the window it just fetched");
        }
        Ok(())
    }

    /// Shrinks the file to `size` logical bytes, removing and truncating
    /// segment files as needed. The write buffer must be empty.
    pub fn truncate(&self, size: i64) -> io::Result<()> {
        let mut largest = self.largest_id.load(Ordering::SeqCst);
        while size < largest * self.segment_size && largest > 0 {
            self.segments.remove(&largest);
            fs::remove_file(Self::segment_path(&self.dir, largest, self.segment_size))?;
            largest -= 1;
            self.largest_id.store(largest, Ordering::SeqCst);
        }
        let tail = size - largest * self.segment_size;
        let path = Self::segment_path(&self.dir, largest, self.segment_size);
        let f = File::options().read(true).write(true).open(path)?;
        f.set_len(tail as u64)?;
        self.segments.insert(largest, Arc::new(f));
        self.tail_size.store(tail, Ordering::SeqCst);
        self.file_size.store(size, Ordering::SeqCst);
        self.file_size_on_disk.store(size, Ordering::SeqCst);
        Ok(())
    }

    /// Deletes every segment file lying entirely before `offset`.
    pub fn prune_head(&self, offset: i64) -> io::Result<()> {
        let keep_from = offset / self.segment_size;
        let doomed: Vec<i64> = self
            .segments
            .iter()
            .map(|e| *e.key())
            .filter(|id| *id < keep_from)
            .collect();
        for id in doomed {
            self.segments.remove(&id);
            fs::remove_file(Self::segment_path(&self.dir, id, self.segment_size))?;
        }
        Ok(())
    }

    /// Drops all open segment handles.
    pub fn close(&self) {
        self.segments.clear();
    }
}

#[cfg(unix)]
fn read_exact_at(f: &File, buf: &mut [u8], pos: u64) -> io::Result<()> {
    f.read_exact_at(buf, pos)
}

#[cfg(not(unix))]
fn read_exact_at(f: &File, buf: &mut [u8], pos: u64) -> io::Result<()> {
    use std::io::Read;
    let mut f = f.try_clone()?;
    f.seek(SeekFrom::Start(pos))?;
    f.read_exact(buf)
}

/// Caches one large chunk of a segment for sequential readers. Each reader
/// thread owns its own `PreReader`; it must not be moved between `HPFile`s.
#[derive(Debug)]
pub struct PreReader {
    buffer: Box<[u8]>,
    start: i64,
    end: i64,
}

impl Default for PreReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PreReader {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; PRE_READ_BUF_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    fn fill<F>(&mut self, start: i64, count: usize, read: F) -> io::Result<()>
    where
        F: FnOnce(&mut [u8]) -> io::Result<()>,
    {
        read(&mut self.buffer[..count])?;
        self.start = start;
        self.end = start + count as i64;
        Ok(())
    }

    fn try_read(&self, start: i64, buf: &mut [u8]) -> bool {
        let end = start + buf.len() as i64;
        if self.start <= start && end <= self.end && self.end > self.start {
            let from = (start - self.start) as usize;
            buf.copy_from_slice(&self.buffer[from..from + buf.len()]);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reopen(dir: &Path) -> HPFile {
        HPFile::new(64, 128, dir).unwrap()
    }

    #[test]
    fn append_read_reopen() {
        let tmp = tempfile::Builder::new().prefix("hpfile").tempdir().unwrap();
        let hp = reopen(tmp.path());
        let mut buffer = Vec::new();

        let a = [1u8; 50];
        let b = [2u8; 60];
        let c = [3u8; 40]; // 50+60+40 > 128, so this one pads to 128 first

        assert_eq!(0, hp.append(&a, &mut buffer).unwrap());
        assert_eq!(50, hp.append(&b, &mut buffer).unwrap());
        assert_eq!(110, hp.size());
        assert_eq!(128, hp.append(&c, &mut buffer).unwrap());
        assert_eq!(168, hp.size());

        hp.flush(&mut buffer).unwrap();
        assert_eq!(hp.size(), hp.size_on_disk());

        let mut got = [0u8; 60];
        hp.read_at(&mut got, 50).unwrap();
        assert_eq!(got, b);

        // the padded gap reads back as zeros
        let mut gap = [9u8; 18];
        hp.read_at(&mut gap, 110).unwrap();
        assert_eq!(gap, [0u8; 18]);

        hp.close();
        let hp = reopen(tmp.path());
        assert_eq!(168, hp.size());
        let mut got = [0u8; 40];
        hp.read_at(&mut got, 128).unwrap();
        assert_eq!(got, c);
    }

    #[test]
    fn pre_reader_matches_plain_reads() {
        let tmp = tempfile::Builder::new().prefix("hpfile").tempdir().unwrap();
        let hp = reopen(tmp.path());
        let mut buffer = Vec::new();
        for i in 0..8u8 {
            hp.append(&[i; 32], &mut buffer).unwrap();
        }
        hp.flush(&mut buffer).unwrap();

        let mut pre = PreReader::new();
        for i in 0..8u8 {
            let mut got = [0u8; 32];
            hp.read_at_with_pre_reader(&mut got, i as i64 * 32, &mut pre)
                .unwrap();
            assert_eq!(got, [i; 32]);
        }
    }

    #[test]
    fn truncate_and_prune() {
        let tmp = tempfile::Builder::new().prefix("hpfile").tempdir().unwrap();
        let hp = reopen(tmp.path());
        let mut buffer = Vec::new();
        for i in 0..8u8 {
            hp.append(&[i; 64], &mut buffer).unwrap();
        }
        hp.flush(&mut buffer).unwrap();
        assert_eq!(512, hp.size()); // four full segments

        hp.truncate(300).unwrap();
        assert_eq!(300, hp.size());
        let mut got = [0u8; 44];
        hp.read_at(&mut got, 256).unwrap();
        assert_eq!(got, [4u8; 44]);

        hp.prune_head(128).unwrap();
        assert_eq!(128, hp.head_offset());
        let mut got = [0u8; 64];
        assert!(hp.read_at(&mut got, 0).is_err());
        hp.read_at(&mut got, 128).unwrap();
        assert_eq!(got, [2u8; 64]);

        // appends keep working after a head prune
        let pos = hp.append(&[9; 16], &mut buffer).unwrap();
        assert_eq!(300, pos);
        hp.flush(&mut buffer).unwrap();
        let mut got = [0u8; 16];
        hp.read_at(&mut got, pos).unwrap();
        assert_eq!(got, [9u8; 16]);
    }
}
