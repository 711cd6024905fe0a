use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Stored payloads start on 32-byte boundaries, so a 40-bit logical offset
/// addresses real offset `offset40 * 32`.
pub const OFFSET_UNIT: i64 = 32;

/// Span of the 40-bit logical offset space in real bytes (32 TiB). A heap
/// whose real size outgrows this aliases logical offsets onto the newest
/// wrap window; see [`real_offset`].
const WRAP_SPAN: i64 = OFFSET_UNIT << 40;

const SEGMENT_SUFFIX: &str = "seg";

/// An append-only byte log backed by fixed-size segment files, named by
/// their starting real offset. The head of the log can be pruned a whole
/// segment at a time; surviving bytes keep their real offsets. The tail can
/// be truncated back to the last durable size during recovery.
pub struct HeapFile {
    dir: PathBuf,
    segment_size: i64,
    /// Surviving segments keyed by starting real offset. Never empty; every
    /// segment except the last is exactly `segment_size` bytes.
    segments: BTreeMap<i64, Segment>,
    /// Real offset one past the last appended byte.
    size: i64,
}

struct Segment {
    file: File,
    path: PathBuf,
}

impl Segment {
    fn path_for(dir: &Path, start: i64) -> PathBuf {
        dir.join(format!("{start:020}.{SEGMENT_SUFFIX}"))
    }

    fn open(dir: &Path, start: i64) -> Result<Self> {
        let path = Self::path_for(dir, start);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self { file, path })
    }
}

impl HeapFile {
    /// Opens the heap directory, creating it (with one empty segment) when
    /// missing, and validates that the surviving segments are contiguous.
    pub fn open(dir: impl Into<PathBuf>, segment_size: i64) -> Result<Self> {
        if segment_size <= 0 || segment_size % OFFSET_UNIT != 0 {
            return Err(Error::InvalidInput(format!(
                "segment size {segment_size} is not a positive multiple of {OFFSET_UNIT}"
            )));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut starts = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_SUFFIX) {
                continue;
            }
            let start = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| {
                    Error::Corrupt(format!("unexpected heap file {}", path.display()))
                })?;
            starts.push(start);
        }
        starts.sort_unstable();

        let mut segments = BTreeMap::new();
        let mut size = 0;
        for (i, &start) in starts.iter().enumerate() {
            let segment = Segment::open(&dir, start)?;
            let len = segment.file.metadata()?.len() as i64;
            let last = i == starts.len() - 1;
            if !last && len != segment_size {
                return Err(Error::Corrupt(format!(
                    "heap segment {} has {len} bytes, expected {segment_size}",
                    segment.path.display()
                )));
            }
            if i > 0 && start != starts[i - 1] + segment_size {
                return Err(Error::Corrupt(format!(
                    "heap segment {} is not contiguous with its predecessor",
                    segment.path.display()
                )));
            }
            if last {
                if len > segment_size {
                    return Err(Error::Corrupt(format!(
                        "heap segment {} has {len} bytes, expected at most {segment_size}",
                        segment.path.display()
                    )));
                }
                size = start + len;
            }
            segments.insert(start, segment);
        }
        if segments.is_empty() {
            segments.insert(0, Segment::open(&dir, 0)?);
        }

        Ok(Self {
            dir,
            segment_size,
            segments,
            size,
        })
    }

    /// Real offset one past the last appended byte. Head pruning does not
    /// shrink it.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// Starting real offset of the oldest surviving segment.
    pub fn head(&self) -> i64 {
        *self.segments.keys().next().expect("heap always has a segment")
    }

    /// Appends the concatenated fragments, rolling into a fresh segment
    /// first when they would cross the current segment boundary. Returns the
    /// real offset of the first appended byte.
    pub fn append(&mut self, fragments: &[&[u8]]) -> Result<i64> {
        let total: i64 = fragments.iter().map(|f| f.len() as i64).sum();
        if total > self.segment_size {
            return Err(Error::InvalidInput(format!(
                "append of {total} bytes exceeds the {} byte segment size",
                self.segment_size
            )));
        }
        let (last_start, _) = self.last_segment();
        if total > last_start + self.segment_size - self.size {
            self.fill_and_roll()?;
        }

        let offset = self.size;
        let (start, segment) = self.last_segment();
        let mut at = (offset - start) as u64;
        for fragment in fragments {
            segment.file.write_all_at(fragment, at)?;
            at += fragment.len() as u64;
        }
        self.size = offset + total;
        Ok(offset)
    }

    /// Reads `buf.len()` bytes starting at `offset`. Fails for reads past
    /// the end or below the pruned head.
    pub fn read_at(&self, buf: &mut [u8], offset: i64) -> Result<()> {
        if offset < 0 || offset + buf.len() as i64 > self.size {
            return Err(Error::InvalidInput(format!(
                "read of {} bytes at {offset} outside heap of size {}",
                buf.len(),
                self.size
            )));
        }
        let mut offset = offset;
        let mut buf = &mut buf[..];
        while !buf.is_empty() {
            let (start, segment) = self
                .segments
                .range(..=offset)
                .next_back()
                .map(|(start, segment)| (*start, segment))
                .ok_or_else(|| {
                    Error::Corrupt(format!("read at {offset} below the pruned heap head"))
                })?;
            let n = ((start + self.segment_size - offset) as usize).min(buf.len());
            segment.file.read_exact_at(&mut buf[..n], (offset - start) as u64)?;
            offset += n as i64;
            buf = &mut buf[n..];
        }
        Ok(())
    }

    /// Discards everything past `real_size`. Recovery uses this to drop the
    /// bytes a half-committed block appended before the crash.
    pub fn truncate(&mut self, real_size: i64) -> Result<()> {
        if real_size > self.size {
            return Err(Error::Corrupt(format!(
                "durable heap size {real_size} exceeds the {} bytes on disk",
                self.size
            )));
        }
        let start = self
            .segments
            .range(..=real_size)
            .next_back()
            .map(|(start, _)| *start)
            .ok_or_else(|| {
                Error::Corrupt(format!(
                    "durable heap size {real_size} lies below the pruned head"
                ))
            })?;

        let doomed: Vec<i64> = self.segments.range(start + 1..).map(|(s, _)| *s).collect();
        for s in doomed {
            let segment = self.segments.remove(&s).expect("segment exists");
            fs::remove_file(&segment.path)?;
        }
        let segment = &self.segments[&start];
        segment.file.set_len((real_size - start) as u64)?;
        segment.file.sync_all()?;
        self.size = real_size;
        Ok(())
    }

    /// Drops every whole segment that lies entirely below `real_offset`. The
    /// segment holding the append tail always survives.
    pub fn prune_head(&mut self, real_offset: i64) -> Result<()> {
        let last_start = self.last_segment().0;
        let doomed: Vec<i64> = self
            .segments
            .range(..last_start)
            .map(|(start, _)| *start)
            .filter(|start| start + self.segment_size <= real_offset)
            .collect();
        for start in doomed {
            let segment = self.segments.remove(&start).expect("segment exists");
            fs::remove_file(&segment.path)?;
        }
        Ok(())
    }

    /// Fsyncs the append tail. Full segments are synced when rolled.
    pub fn flush(&self) -> Result<()> {
        self.last_segment().1.file.sync_all()?;
        Ok(())
    }

    /// Appends a payload framed as a 4-byte little-endian length, the data,
    /// and zero padding to the next 32-byte boundary. Returns the logical
    /// 40-bit offset of the frame.
    pub fn append_payload(&mut self, data: &[u8]) -> Result<i64> {
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, data.len() as u32);
        let zeros = [0u8; OFFSET_UNIT as usize];
        let pad = (4 + data.len()).next_multiple_of(OFFSET_UNIT as usize) - 4 - data.len();
        let offset = self.append(&[&len_buf, data, &zeros[..pad]])?;
        debug_assert_eq!(offset % OFFSET_UNIT, 0);
        Ok(offset / OFFSET_UNIT)
    }

    /// Reads back the payload at a logical offset returned by
    /// [`HeapFile::append_payload`].
    pub fn read_payload(&self, offset40: i64) -> Result<Vec<u8>> {
        let offset = real_offset(offset40, self.size);
        let mut len_buf = [0u8; 4];
        self.read_at(&mut len_buf, offset)?;
        let len = LittleEndian::read_u32(&len_buf) as usize;
        let mut frame = vec![0u8; 4 + len];
        self.read_at(&mut frame, offset)?;
        Ok(frame.split_off(4))
    }

    fn last_segment(&self) -> (i64, &Segment) {
        let (start, segment) = self
            .segments
            .iter()
            .next_back()
            .expect("heap always has a segment");
        (*start, segment)
    }

    /// Zero-fills the remainder of the current tail segment, syncs it, and
    /// starts a fresh one.
    fn fill_and_roll(&mut self) -> Result<()> {
        let (start, segment) = self.last_segment();
        let mut at = self.size - start;
        let zeros = [0u8; 4096];
        while at < self.segment_size {
            let n = ((self.segment_size - at) as usize).min(zeros.len());
            segment.file.write_all_at(&zeros[..n], at as u64)?;
            at += n as i64;
        }
        segment.file.sync_all()?;

        let new_start = start + self.segment_size;
        self.segments.insert(new_start, Segment::open(&self.dir, new_start)?);
        self.size = new_start;
        Ok(())
    }
}

/// Maps a 40-bit logical offset onto the newest 32-TiB wrap window of the
/// heap's real address space. Callers may only ask for still-live locations:
/// the pruned prefix has no valid logical references.
pub fn real_offset(offset40: i64, size: i64) -> i64 {
    let mut n = size / WRAP_SPAN;
    if size % WRAP_SPAN == 0 {
        n -= 1;
    }
    let mut offset = offset40 * OFFSET_UNIT + n * WRAP_SPAN;
    if offset > size {
        offset -= WRAP_SPAN;
    }
    offset
}
