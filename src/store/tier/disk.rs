//! Disk Tier
//!
//! Append-only record file with an in-memory index.
//!
//! # Record format
//!
//! `[u32 little-endian length][JSON-encoded element]`
//!
//! Replaced and removed records stay in the file as garbage until it
//! outweighs the live records, at which point the file is rewritten with
//! only live records. The file is truncated when the tier opens: contents do
//! not survive a restart.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, instrument};

use super::{EntryMeta, PinnedCount, Tier, TierCapacity, TierKind, TIER_SHARDS};
use crate::error::{Error, Result};
use crate::store::element::{CacheKey, Element, StoredElement};
use crate::store::policy::Candidate;
use crate::store::shard::ShardedMap;

const HEADER_LEN: u64 = 4;

/// Garbage below this many bytes never triggers compaction
pub const MIN_COMPACTION_GARBAGE: u64 = 64 * 1024;

#[derive(Clone, Copy)]
struct Slot {
    offset: u64,
    len: u64,
    meta: EntryMeta,
}

struct DataFile {
    file: File,
    end: u64,
    garbage: u64,
}

/// File-backed tier
pub struct DiskTier {
    path: PathBuf,
    index: ShardedMap<Slot, TIER_SHARDS>,
    pinned: PinnedCount,
    data: Mutex<DataFile>,
    capacity: TierCapacity,
    min_compaction_garbage: u64,
}

impl DiskTier {
    /// Create (or truncate) the record file at `path`
    pub fn open(path: impl AsRef<Path>, capacity: TierCapacity) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = Self::open_file(&path, true)?;
        debug!(path = %path.display(), "Opened disk tier");

        Ok(Self {
            path,
            index: ShardedMap::new(),
            pinned: PinnedCount::default(),
            data: Mutex::new(DataFile {
                file,
                end: 0,
                garbage: 0,
            }),
            capacity,
            min_compaction_garbage: MIN_COMPACTION_GARBAGE,
        })
    }

    /// Override the compaction threshold
    pub fn with_min_compaction_garbage(mut self, bytes: u64) -> Self {
        self.min_compaction_garbage = bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the record file, garbage included
    pub fn file_len(&self) -> u64 {
        self.data.lock().end
    }

    /// Bytes held by dead records
    pub fn garbage_bytes(&self) -> u64 {
        self.data.lock().garbage
    }

    fn open_file(path: &Path, truncate: bool) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)?)
    }

    fn read_record(data: &mut DataFile, slot: &Slot) -> Result<Element> {
        data.file.seek(SeekFrom::Start(slot.offset + HEADER_LEN))?;
        let mut buf = vec![0u8; (slot.len - HEADER_LEN) as usize];
        data.file.read_exact(&mut buf)?;
        let stored: StoredElement = serde_json::from_slice(&buf)?;
        Ok(stored.into_element())
    }

    fn retire(&self, data: &mut DataFile, slot: Option<Slot>) -> Result<Option<Element>> {
        match slot {
            Some(slot) => {
                let element = Self::read_record(data, &slot)?;
                data.garbage += slot.len;
                Ok(Some(element))
            }
            None => Ok(None),
        }
    }

    fn maybe_compact(&self, data: &mut DataFile) -> Result<()> {
        let live = self.index.size_bytes();
        if data.garbage >= self.min_compaction_garbage && data.garbage > live {
            self.compact(data)?;
        }
        Ok(())
    }

    #[instrument(skip(self, data), fields(path = %self.path.display()))]
    fn compact(&self, data: &mut DataFile) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        let tmp = Self::open_file(&tmp_path, true)?;
        let mut writer = BufWriter::new(tmp);
        let mut relocated = Vec::with_capacity(self.index.len());
        let mut offset = 0u64;
        let mut buf = Vec::new();

        for (key, slot) in self.index.entries() {
            data.file.seek(SeekFrom::Start(slot.offset))?;
            buf.resize(slot.len as usize, 0);
            data.file.read_exact(&mut buf)?;
            writer.write_all(&buf)?;
            relocated.push((key, offset));
            offset += slot.len;
        }

        let tmp = writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path)?;

        data.file = Self::open_file(&self.path, false)?;
        let reclaimed = data.end - offset;
        data.end = offset;
        data.garbage = 0;
        for (key, new_offset) in relocated {
            self.index.update(&key, |slot| slot.offset = new_offset);
        }

        debug!(reclaimed, live = offset, "Compacted disk tier");
        Ok(())
    }
}

impl Tier for DiskTier {
    fn kind(&self) -> TierKind {
        TierKind::OnDisk
    }

    fn capacity(&self) -> TierCapacity {
        self.capacity
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn pinned_len(&self) -> usize {
        self.pinned.get()
    }

    fn size_bytes(&self) -> u64 {
        self.index.size_bytes()
    }

    fn contains_key(&self, key: &CacheKey) -> bool {
        self.index.contains_key(key)
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Element>> {
        let mut data = self.data.lock();
        match self.index.get(key) {
            Some(slot) => Self::read_record(&mut data, &slot).map(Some),
            None => Ok(None),
        }
    }

    fn put(&self, element: Element) -> Result<Option<Element>> {
        let stored = StoredElement::from_element(&element).ok_or_else(|| {
            Error::Internal(format!(
                "soft-locked element {} cannot leave the heap tier",
                element.key()
            ))
        })?;
        let payload = serde_json::to_vec(&stored)?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| Error::Internal(format!("record for {} too large", element.key())))?;

        let mut data = self.data.lock();
        let offset = data.end;
        data.file.seek(SeekFrom::Start(offset))?;
        data.file.write_all(&payload_len.to_le_bytes())?;
        data.file.write_all(&payload)?;

        let slot = Slot {
            offset,
            len: HEADER_LEN + payload.len() as u64,
            meta: EntryMeta::of(&element),
        };
        data.end += slot.len;

        let previous = self.index.insert(element.key().clone(), slot, slot.len);
        self.pinned
            .replace(previous.map(|s| s.meta.pinned), Some(slot.meta.pinned));
        let previous = self.retire(&mut data, previous)?;
        self.maybe_compact(&mut data)?;
        Ok(previous)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<Element>> {
        let mut data = self.data.lock();
        let removed = self.index.remove(key);
        self.pinned.replace(removed.map(|s| s.meta.pinned), None);
        let removed = self.retire(&mut data, removed)?;
        self.maybe_compact(&mut data)?;
        Ok(removed)
    }

    fn clear_reference(&self, key: &CacheKey) {
        self.index
            .update(key, |slot| slot.meta.eviction.referenced = false);
    }

    fn sample(
        &self,
        start: usize,
        limit: usize,
        filter: &dyn Fn(&Candidate) -> bool,
    ) -> Vec<Candidate> {
        self.index.sample(start, limit, |key, slot| {
            let candidate = slot.meta.candidate(key);
            filter(&candidate).then_some(candidate)
        })
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.index.keys()
    }

    fn clear(&self) -> Result<usize> {
        let mut data = self.data.lock();
        let removed = self.index.clear();
        self.pinned.reset();
        data.file.set_len(0)?;
        data.end = 0;
        data.garbage = 0;
        Ok(removed)
    }
}

impl Drop for DiskTier {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Disk tier file already gone");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> DiskTier {
        DiskTier::open(dir.path().join("cache.data"), TierCapacity::default()).unwrap()
    }

    #[test]
    fn test_disk_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open(&dir);

        assert!(tier.put(Element::new("a", "alpha")).unwrap().is_none());
        assert!(tier.put(Element::new("b", "beta")).unwrap().is_none());

        let a = tier.get(&CacheKey::new("a")).unwrap().unwrap();
        assert_eq!(a.value().unwrap().as_ref(), b"alpha");

        let removed = tier.remove(&CacheKey::new("b")).unwrap().unwrap();
        assert_eq!(removed.value().unwrap().as_ref(), b"beta");
        assert!(tier.get(&CacheKey::new("b")).unwrap().is_none());
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_disk_replace_leaves_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open(&dir);

        tier.put(Element::new("a", "one")).unwrap();
        let previous = tier.put(Element::new("a", "two")).unwrap().unwrap();
        assert_eq!(previous.value().unwrap().as_ref(), b"one");
        assert!(tier.garbage_bytes() > 0);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_disk_compaction_keeps_live_records() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open(&dir).with_min_compaction_garbage(1);

        for i in 0..20 {
            tier.put(Element::new(format!("k{}", i), format!("v{}", i)))
                .unwrap();
        }
        let full_len = tier.file_len();
        for i in 0..15 {
            tier.remove(&CacheKey::new(format!("k{}", i))).unwrap();
        }

        assert_eq!(tier.len(), 5);
        assert!(tier.garbage_bytes() <= tier.size_bytes());
        assert_eq!(tier.file_len(), tier.size_bytes() + tier.garbage_bytes());
        assert!(tier.file_len() < full_len);
        for i in 15..20 {
            let element = tier.get(&CacheKey::new(format!("k{}", i))).unwrap().unwrap();
            assert_eq!(element.value().unwrap().as_ref(), format!("v{}", i).as_bytes());
        }
    }

    #[test]
    fn test_disk_clear_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open(&dir);
        tier.put(Element::new("a", "1")).unwrap();
        assert_eq!(tier.clear().unwrap(), 1);
        assert_eq!(tier.file_len(), 0);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_disk_pinned_count_survives_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path().join("cache.data"), TierCapacity::default())
            .unwrap()
            .with_min_compaction_garbage(0);
        tier.put(Element::new("a", "1").pinned()).unwrap();
        tier.put(Element::new("b", "1")).unwrap();
        tier.put(Element::new("a", "2").pinned()).unwrap();
        assert_eq!(tier.pinned_len(), 1);
        assert_eq!(tier.evictable_len(), 1);

        tier.remove(&CacheKey::new("a")).unwrap();
        assert_eq!(tier.pinned_len(), 0);
        assert_eq!(tier.evictable_len(), 1);
    }
}
