use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};
use endian_trait::Endian;

use dbs_tools::fs::open_file;
use dbs_tools::lru_cache::LruCache;
use nix::fcntl::OFlag;

// openssl::sha::sha256(b"dedup blockstore disk hash index v1.0")[0..8]
pub const DISK_HASH_INDEX_MAGIC_1_0: [u8; 8] = [212, 17, 139, 70, 241, 86, 133, 24];

const HEADER_SIZE: usize = 4096; // the header occupies one full page
const PAGE_CRC_SIZE: usize = 4;
const SLOT_META_SIZE: usize = 3; // flag u8 + value_len u16

const SLOT_EMPTY: u8 = 0;
const SLOT_USED: u8 = 1;
const SLOT_DELETED: u8 = 2;

/// Header of a disk hash index file, stored at the start of the first
/// page; the rest of the page is reserved.
#[derive(Endian)]
#[repr(C)]
struct DiskHashHeader {
    magic: [u8; 8],
    version: u32,
    page_size: u32,
    page_count: u64,
    key_size: u32,
    value_size: u32,
}

const HEADER_STRUCT_SIZE: usize = std::mem::size_of::<DiskHashHeader>();
const _: () = assert!(HEADER_STRUCT_SIZE == 32);

#[derive(Clone, Debug)]
pub struct DiskHashConfig {
    pub page_size: usize,
    pub page_count: u64,
    pub key_size: usize,
    pub value_size: usize,
    pub cache_pages: usize,
    pub file_mode: u32,
}

impl DiskHashConfig {
    pub fn new(page_count: u64, key_size: usize, value_size: usize) -> Self {
        Self {
            page_size: 4096,
            page_count,
            key_size,
            value_size,
            cache_pages: 64,
            file_mode: 0o640,
        }
    }
}

/// Persistent hash map with fixed-size key and value slots.
///
/// A static file of bucket pages, linear probing across page boundaries,
/// tombstones for deletes, a per-page CRC32 and an LRU page cache. This is
/// the storage behind the chunk index, the block index, the failed-writes
/// index and the container meta-data index.
pub struct DiskHashIndex {
    file: File,
    path: PathBuf,
    page_size: usize,
    page_count: u64,
    key_size: usize,
    value_size: usize,
    slots_per_page: usize,
    state: Mutex<IndexState>,
}

struct IndexState {
    pages: LruCache<u64, Vec<u8>>,
    item_count: u64,
}

fn fold_key(key: &[u8]) -> u64 {
    // splitmix64 over the key bytes; block ids are sequential, so the
    // mixer matters.
    let mut acc: u64 = 0x9e3779b97f4a7c15;
    for chunk in key.chunks(8) {
        let mut buf = [0u8; 8];
        buf[..chunk.len()].copy_from_slice(chunk);
        acc ^= u64::from_le_bytes(buf);
        acc = acc.wrapping_add(0x9e3779b97f4a7c15);
        acc = (acc ^ (acc >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        acc = (acc ^ (acc >> 27)).wrapping_mul(0x94d049bb133111eb);
        acc ^= acc >> 31;
    }
    acc
}

impl DiskHashIndex {
    pub fn create<P: AsRef<Path>>(path: P, config: DiskHashConfig) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        let slot_size = SLOT_META_SIZE + config.key_size + config.value_size;
        if config.page_size < PAGE_CRC_SIZE + slot_size {
            bail!(
                "page size {} cannot hold a single {} byte slot",
                config.page_size,
                slot_size
            );
        }
        if config.key_size == 0 || config.value_size > u16::MAX as usize {
            bail!("invalid slot geometry");
        }
        if path.exists() {
            bail!("index {path:?} already exists");
        }

        let file = open_file(
            &path,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            config.file_mode,
        )?;

        let header = DiskHashHeader {
            magic: DISK_HASH_INDEX_MAGIC_1_0,
            version: 1,
            page_size: config.page_size as u32,
            page_count: config.page_count,
            key_size: config.key_size as u32,
            value_size: config.value_size as u32,
        }
        .to_le();
        let mut buffer = vec![0u8; HEADER_SIZE];
        buffer[..HEADER_STRUCT_SIZE].copy_from_slice(unsafe {
            std::slice::from_raw_parts(
                &header as *const DiskHashHeader as *const u8,
                HEADER_STRUCT_SIZE,
            )
        });
        file.write_all_at(&buffer, 0)?;

        let total = HEADER_SIZE as u64 + config.page_count * config.page_size as u64;
        nix::unistd::ftruncate(file.as_raw_fd(), total as i64)?;

        Ok(Self {
            file,
            path,
            page_size: config.page_size,
            page_count: config.page_count,
            key_size: config.key_size,
            value_size: config.value_size,
            slots_per_page: (config.page_size - PAGE_CRC_SIZE) / slot_size,
            state: Mutex::new(IndexState {
                pages: LruCache::new(config.cache_pages),
                item_count: 0,
            }),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, cache_pages: usize) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = open_file(&path, OFlag::O_RDWR, 0o640)?;

        let mut buffer = vec![0u8; HEADER_SIZE];
        file.read_exact_at(&mut buffer, 0)
            .map_err(|err| format_err!("unable to read index header {path:?} - {err}"))?;
        let header =
            unsafe { std::ptr::read_unaligned(buffer.as_ptr() as *const DiskHashHeader) }
                .from_le();

        if header.magic != DISK_HASH_INDEX_MAGIC_1_0 {
            bail!("index {path:?} has unknown magic number");
        }
        if header.version != 1 {
            bail!("index {path:?} has unsupported version {}", header.version);
        }

        let page_size = header.page_size as usize;
        let page_count = header.page_count;
        let key_size = header.key_size as usize;
        let value_size = header.value_size as usize;
        let slot_size = SLOT_META_SIZE + key_size + value_size;

        let index = Self {
            file,
            path,
            page_size,
            page_count,
            key_size,
            value_size,
            slots_per_page: (page_size - PAGE_CRC_SIZE) / slot_size,
            state: Mutex::new(IndexState {
                pages: LruCache::new(cache_pages.max(1)),
                item_count: 0,
            }),
        };

        let mut count = 0u64;
        index.for_each_page(|page| {
            count += index.used_slots(page) as u64;
            Ok(())
        })?;
        index.state.lock().unwrap().item_count = count;

        Ok(index)
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn item_count(&self) -> u64 {
        self.state.lock().unwrap().item_count
    }

    pub fn total_slots(&self) -> u64 {
        self.page_count * self.slots_per_page as u64
    }

    /// Usable capacity; beyond this inserts fail to keep probe chains short.
    pub fn estimated_max_items(&self) -> u64 {
        self.total_slots() * 7 / 8
    }

    pub fn is_full(&self) -> bool {
        self.item_count() >= self.estimated_max_items()
    }

    fn slot_size(&self) -> usize {
        SLOT_META_SIZE + self.key_size + self.value_size
    }

    fn check_key(&self, key: &[u8]) -> Result<(), Error> {
        if key.len() != self.key_size {
            bail!(
                "index {:?}: got key size {}, expected {}",
                self.path,
                key.len(),
                self.key_size
            );
        }
        Ok(())
    }

    fn page_offset(&self, page: u64) -> u64 {
        HEADER_SIZE as u64 + page * self.page_size as u64
    }

    fn read_page(&self, page: u64) -> Result<Vec<u8>, Error> {
        let mut buffer = vec![0u8; self.page_size];
        self.file
            .read_exact_at(&mut buffer, self.page_offset(page))
            .map_err(|err| {
                format_err!("unable to read page {page} of index {:?} - {err}", self.path)
            })?;

        let stored_crc = u32::from_le_bytes(buffer[0..4].try_into().unwrap());
        if stored_crc != 0 {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&buffer[PAGE_CRC_SIZE..]);
            if hasher.finalize() != stored_crc {
                bail!("page {page} of index {:?} has wrong CRC checksum", self.path);
            }
        } else if buffer[PAGE_CRC_SIZE..].iter().any(|b| *b != 0) {
            bail!("page {page} of index {:?} has wrong CRC checksum", self.path);
        }

        Ok(buffer)
    }

    fn write_page(&self, page: u64, buffer: &mut Vec<u8>) -> Result<(), Error> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buffer[PAGE_CRC_SIZE..]);
        let crc = hasher.finalize();
        buffer[0..4].copy_from_slice(&crc.to_le_bytes());
        self.file
            .write_all_at(buffer, self.page_offset(page))
            .map_err(|err| {
                format_err!("unable to write page {page} of index {:?} - {err}", self.path)
            })
    }

    fn with_page<R>(
        &self,
        state: &mut IndexState,
        page: u64,
        update: impl FnOnce(&mut Vec<u8>) -> R,
        dirty: bool,
    ) -> Result<R, Error> {
        if state.pages.get_mut(page).is_none() {
            let buffer = self.read_page(page)?;
            state.pages.insert(page, buffer);
        }
        let buffer = state.pages.get_mut(page).expect("page just inserted");
        let result = update(buffer);
        if dirty {
            let mut buffer = state.pages.remove(page).expect("page just updated");
            self.write_page(page, &mut buffer)?;
            state.pages.insert(page, buffer);
        }
        Ok(result)
    }

    fn used_slots(&self, page: &[u8]) -> usize {
        let slot_size = self.slot_size();
        (0..self.slots_per_page)
            .filter(|slot| page[PAGE_CRC_SIZE + slot * slot_size] == SLOT_USED)
            .count()
    }

    fn slot_range(&self, slot: usize) -> std::ops::Range<usize> {
        let start = PAGE_CRC_SIZE + slot * self.slot_size();
        start..start + self.slot_size()
    }

    /// Probe sequence over global slot numbers, starting at the key hash.
    fn probe_start(&self, key: &[u8]) -> u64 {
        fold_key(key) % self.total_slots()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.check_key(key)?;
        let mut state = self.state.lock().unwrap();

        let total = self.total_slots();
        let start = self.probe_start(key);
        for probe in 0..total {
            let global = (start + probe) % total;
            let page = global / self.slots_per_page as u64;
            let slot = (global % self.slots_per_page as u64) as usize;
            let range = self.slot_range(slot);

            enum Hit {
                Miss,
                Continue,
                Found(Vec<u8>),
            }

            let hit = self.with_page(
                &mut state,
                page,
                |buffer| {
                    let data = &buffer[range];
                    match data[0] {
                        SLOT_EMPTY => Hit::Miss,
                        SLOT_DELETED => Hit::Continue,
                        _ => {
                            if &data[SLOT_META_SIZE..SLOT_META_SIZE + key.len()] == key {
                                let value_len =
                                    u16::from_le_bytes(data[1..3].try_into().unwrap()) as usize;
                                let value_start = SLOT_META_SIZE + key.len();
                                Hit::Found(data[value_start..value_start + value_len].to_vec())
                            } else {
                                Hit::Continue
                            }
                        }
                    }
                },
                false,
            )?;

            match hit {
                Hit::Miss => return Ok(None),
                Hit::Found(value) => return Ok(Some(value)),
                Hit::Continue => continue,
            }
        }
        Ok(None)
    }

    /// Insert or overwrite an entry.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.check_key(key)?;
        if value.len() > self.value_size {
            bail!(
                "index {:?}: value size {} exceeds slot size {}",
                self.path,
                value.len(),
                self.value_size
            );
        }

        let mut state = self.state.lock().unwrap();

        let total = self.total_slots();
        let start = self.probe_start(key);
        let mut free_slot: Option<u64> = None;

        for probe in 0..total {
            let global = (start + probe) % total;
            let page = global / self.slots_per_page as u64;
            let slot = (global % self.slots_per_page as u64) as usize;
            let range = self.slot_range(slot);

            enum Probe {
                Empty,
                Deleted,
                Match,
                Other,
            }

            let outcome = self.with_page(
                &mut state,
                page,
                |buffer| {
                    let data = &buffer[range];
                    match data[0] {
                        SLOT_EMPTY => Probe::Empty,
                        SLOT_DELETED => Probe::Deleted,
                        _ => {
                            if &data[SLOT_META_SIZE..SLOT_META_SIZE + key.len()] == key {
                                Probe::Match
                            } else {
                                Probe::Other
                            }
                        }
                    }
                },
                false,
            )?;

            match outcome {
                Probe::Match => {
                    self.store_slot(&mut state, global, key, value, false)?;
                    return Ok(());
                }
                Probe::Deleted => {
                    if free_slot.is_none() {
                        free_slot = Some(global);
                    }
                }
                Probe::Empty => {
                    if state.item_count >= self.estimated_max_items() {
                        bail!("index {:?} is full ({} items)", self.path, state.item_count);
                    }
                    let target = free_slot.unwrap_or(global);
                    self.store_slot(&mut state, target, key, value, true)?;
                    return Ok(());
                }
                Probe::Other => continue,
            }
        }

        if let Some(target) = free_slot {
            if state.item_count >= self.estimated_max_items() {
                bail!("index {:?} is full ({} items)", self.path, state.item_count);
            }
            self.store_slot(&mut state, target, key, value, true)?;
            return Ok(());
        }
        bail!("index {:?} is full ({} items)", self.path, state.item_count);
    }

    fn store_slot(
        &self,
        state: &mut IndexState,
        global: u64,
        key: &[u8],
        value: &[u8],
        new_item: bool,
    ) -> Result<(), Error> {
        let page = global / self.slots_per_page as u64;
        let slot = (global % self.slots_per_page as u64) as usize;
        let range = self.slot_range(slot);
        let key_size = self.key_size;

        self.with_page(
            state,
            page,
            |buffer| {
                let data = &mut buffer[range];
                data.fill(0);
                data[0] = SLOT_USED;
                data[1..3].copy_from_slice(&(value.len() as u16).to_le_bytes());
                data[SLOT_META_SIZE..SLOT_META_SIZE + key_size].copy_from_slice(key);
                data[SLOT_META_SIZE + key_size..SLOT_META_SIZE + key_size + value.len()]
                    .copy_from_slice(value);
            },
            true,
        )?;

        if new_item {
            state.item_count += 1;
        }
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        self.check_key(key)?;
        let mut state = self.state.lock().unwrap();

        let total = self.total_slots();
        let start = self.probe_start(key);
        for probe in 0..total {
            let global = (start + probe) % total;
            let page = global / self.slots_per_page as u64;
            let slot = (global % self.slots_per_page as u64) as usize;
            let range = self.slot_range(slot);

            enum Probe {
                Empty,
                Removed,
                Continue,
            }

            let outcome = self.with_page(
                &mut state,
                page,
                |buffer| {
                    let data = &mut buffer[range];
                    match data[0] {
                        SLOT_EMPTY => (Probe::Empty, false),
                        SLOT_DELETED => (Probe::Continue, false),
                        _ => {
                            if &data[SLOT_META_SIZE..SLOT_META_SIZE + key.len()] == key {
                                data[0] = SLOT_DELETED;
                                (Probe::Removed, true)
                            } else {
                                (Probe::Continue, false)
                            }
                        }
                    }
                },
                false,
            )?;

            // write back only when the slot actually changed
            let (outcome, dirty) = outcome;
            if dirty {
                let mut buffer = state.pages.remove(page).expect("page cached during delete");
                self.write_page(page, &mut buffer)?;
                state.pages.insert(page, buffer);
            }

            match outcome {
                Probe::Empty => return Ok(false),
                Probe::Removed => {
                    state.item_count -= 1;
                    return Ok(true);
                }
                Probe::Continue => continue,
            }
        }
        Ok(false)
    }

    fn for_each_page(&self, mut callback: impl FnMut(&[u8]) -> Result<(), Error>) -> Result<(), Error> {
        for page in 0..self.page_count {
            let buffer = self.read_page(page)?;
            callback(&buffer)?;
        }
        Ok(())
    }

    /// Visit every entry. Reads pages directly, bypassing the cache.
    pub fn iterate(
        &self,
        mut callback: impl FnMut(&[u8], &[u8]) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let slot_size = self.slot_size();
        let key_size = self.key_size;
        self.for_each_page(|buffer| {
            for slot in 0..self.slots_per_page {
                let start = PAGE_CRC_SIZE + slot * slot_size;
                let data = &buffer[start..start + slot_size];
                if data[0] != SLOT_USED {
                    continue;
                }
                let value_len = u16::from_le_bytes(data[1..3].try_into().unwrap()) as usize;
                let value_start = SLOT_META_SIZE + key_size;
                callback(
                    &data[SLOT_META_SIZE..value_start],
                    &data[value_start..value_start + value_len],
                )?;
            }
            Ok(())
        })
    }

    /// Drop every entry, keeping the geometry. Used by the restorer.
    pub fn clear(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let zeroed = vec![0u8; self.page_size];
        for page in 0..self.page_count {
            self.file.write_all_at(&zeroed, self.page_offset(page))?;
        }
        state.pages.clear();
        state.item_count = 0;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), Error> {
        dbs_tools::fs::datasync(&self.file)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn testfile(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("dbs-disk-hash-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn put_get_delete_persist() {
        let path = testfile("basic");
        let index = DiskHashIndex::create(&path, DiskHashConfig::new(8, 8, 16)).unwrap();

        for id in 0u64..100 {
            index.put(&id.to_le_bytes(), &[id as u8; 16]).unwrap();
        }
        assert_eq!(index.item_count(), 100);

        assert_eq!(index.get(&7u64.to_le_bytes()).unwrap(), Some(vec![7u8; 16]));
        assert!(index.delete(&7u64.to_le_bytes()).unwrap());
        assert!(!index.delete(&7u64.to_le_bytes()).unwrap());
        assert_eq!(index.get(&7u64.to_le_bytes()).unwrap(), None);
        index.flush().unwrap();
        drop(index);

        let index = DiskHashIndex::open(&path, 16).unwrap();
        assert_eq!(index.item_count(), 99);
        assert_eq!(index.get(&8u64.to_le_bytes()).unwrap(), Some(vec![8u8; 16]));

        let mut seen = 0;
        index
            .iterate(|_key, value| {
                assert_eq!(value.len(), 16);
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 99);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn overwrite_keeps_count() {
        let path = testfile("overwrite");
        let index = DiskHashIndex::create(&path, DiskHashConfig::new(4, 8, 8)).unwrap();
        index.put(&1u64.to_le_bytes(), b"aaaa").unwrap();
        index.put(&1u64.to_le_bytes(), b"bbbbbb").unwrap();
        assert_eq!(index.item_count(), 1);
        assert_eq!(index.get(&1u64.to_le_bytes()).unwrap(), Some(b"bbbbbb".to_vec()));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn fills_up() {
        let path = testfile("full");
        let index = DiskHashIndex::create(&path, DiskHashConfig::new(1, 8, 8)).unwrap();
        let max = index.estimated_max_items();
        for id in 0..max {
            index.put(&id.to_le_bytes(), b"x").unwrap();
        }
        assert!(index.is_full());
        assert!(index.put(&u64::MAX.to_le_bytes(), b"x").is_err());
        // overwriting an existing key still works
        index.put(&0u64.to_le_bytes(), b"y").unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn empty_value_slots() {
        let path = testfile("emptyval");
        let index = DiskHashIndex::create(&path, DiskHashConfig::new(2, 12, 0)).unwrap();
        index.put(&[3u8; 12], b"").unwrap();
        assert_eq!(index.get(&[3u8; 12]).unwrap(), Some(Vec::new()));
        assert_eq!(index.get(&[4u8; 12]).unwrap(), None);
        let _ = std::fs::remove_file(&path);
    }
}
