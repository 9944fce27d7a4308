use std::collections::{BTreeSet, HashMap};

use anyhow::{bail, format_err, Error};

use dbs_api_types::{Fingerprint, MAX_FINGERPRINT_SIZE};

// openssl::sha::sha256(b"dedup blockstore container v1.0")[0..8]
pub const CONTAINER_MAGIC_1_0: [u8; 8] = [174, 59, 12, 227, 101, 48, 190, 83];

// magic 8 + total_size 4 + primary_id 8 + secondary_count 2 + item_count 4
// + active_data_size 8
const HEADER_SIZE: usize = 34;
// key_size 1 + key 32 + raw_size 4 + compressed_size 4 + original_id 8
// + flags 1 + offset 4
const DIRECTORY_ENTRY_SIZE: usize = 54;
const TRAILER_SIZE: usize = 4; // crc32

const ITEM_FLAG_INDEXED: u8 = 0x01;
const ITEM_FLAG_DELETED: u8 = 0x02;
const ITEM_FLAG_COMPRESSED: u8 = 0x04;

/// Directory area reserved inside a container, bounding the item count.
pub const METADATA_AREA_SIZE: usize = 8192;

/// One chunk payload stored in a container.
#[derive(Clone, Debug)]
pub struct ContainerItem {
    pub key: Fingerprint,
    pub raw_size: u32,
    /// Container id the item was first written into; preserved across
    /// merges so chunk-index addresses stay redirectable.
    pub original_id: u64,
    pub is_indexed: bool,
    pub is_deleted: bool,
    payload: Vec<u8>,
}

impl ContainerItem {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A fixed-capacity aggregate of chunk payloads.
///
/// In memory the items are an ordered sequence plus a transient
/// fingerprint → position map rebuilt on load. The serialized form is a
/// directory area followed by the (optionally compressed) payloads and a
/// trailing CRC32.
#[derive(Clone, Debug)]
pub struct Container {
    primary_id: u64,
    secondary_ids: BTreeSet<u64>,
    items: Vec<ContainerItem>,
    by_key: HashMap<Fingerprint, usize>,
    capacity: usize,
}

impl Container {
    pub fn new(primary_id: u64, capacity: usize) -> Self {
        Self {
            primary_id,
            secondary_ids: BTreeSet::new(),
            items: Vec::new(),
            by_key: HashMap::new(),
            capacity,
        }
    }

    pub fn primary_id(&self) -> u64 {
        self.primary_id
    }

    pub fn secondary_ids(&self) -> &BTreeSet<u64> {
        &self.secondary_ids
    }

    pub fn add_secondary_id(&mut self, id: u64) {
        if id != self.primary_id {
            self.secondary_ids.insert(id);
        }
    }

    /// All ids resolving to this container.
    pub fn all_ids(&self) -> Vec<u64> {
        let mut ids = vec![self.primary_id];
        ids.extend(self.secondary_ids.iter().copied());
        ids
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn active_item_count(&self) -> usize {
        self.items.iter().filter(|i| !i.is_deleted).count()
    }

    /// Summed raw size of the non-deleted items.
    pub fn active_data_size(&self) -> u64 {
        self.items
            .iter()
            .filter(|i| !i.is_deleted)
            .map(|i| i.raw_size as u64)
            .sum()
    }

    pub fn items(&self) -> &[ContainerItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_items(&self) -> usize {
        METADATA_AREA_SIZE / DIRECTORY_ENTRY_SIZE
    }

    /// Worst-case serialized size, assuming nothing compresses.
    fn serialized_estimate(&self) -> usize {
        HEADER_SIZE
            + self.secondary_ids.len() * 8
            + self.items.len() * DIRECTORY_ENTRY_SIZE
            + self
                .items
                .iter()
                .map(|i| i.payload.len())
                .sum::<usize>()
            + TRAILER_SIZE
    }

    /// Whether another payload of `size` bytes fits.
    pub fn fits(&self, size: usize) -> bool {
        if self.items.len() >= self.max_items() {
            return false;
        }
        self.serialized_estimate() + DIRECTORY_ENTRY_SIZE + size <= self.capacity
    }

    pub fn add_item(
        &mut self,
        key: Fingerprint,
        payload: Vec<u8>,
        is_indexed: bool,
    ) -> Result<(), Error> {
        if !self.fits(payload.len()) {
            bail!(
                "container {} is full ({} items, {} bytes)",
                self.primary_id,
                self.items.len(),
                self.active_data_size()
            );
        }
        if self.by_key.contains_key(&key) {
            bail!("container {} already holds chunk {}", self.primary_id, key);
        }
        self.by_key.insert(key, self.items.len());
        self.items.push(ContainerItem {
            key,
            raw_size: payload.len() as u32,
            original_id: self.primary_id,
            is_indexed,
            is_deleted: false,
            payload,
        });
        Ok(())
    }

    pub fn find_item(&self, key: &Fingerprint) -> Option<&ContainerItem> {
        let item = &self.items[*self.by_key.get(key)?];
        if item.is_deleted {
            None
        } else {
            Some(item)
        }
    }

    /// Mark an item deleted; its space is reclaimed at the next merge/move.
    pub fn delete_item(&mut self, key: &Fingerprint) -> bool {
        match self.by_key.get(key) {
            Some(&pos) if !self.items[pos].is_deleted => {
                self.items[pos].is_deleted = true;
                true
            }
            _ => false,
        }
    }

    /// Copy the live items of `other`, preserving their original ids.
    ///
    /// Items failing `keep` are dropped (reclaimed); their keys are
    /// returned.
    pub fn absorb(
        &mut self,
        other: &Container,
        keep: &mut dyn FnMut(&Fingerprint) -> bool,
    ) -> Result<Vec<Fingerprint>, Error> {
        let mut dropped = Vec::new();
        for item in &other.items {
            if item.is_deleted {
                continue;
            }
            if !keep(&item.key) {
                dropped.push(item.key);
                continue;
            }
            if self.by_key.contains_key(&item.key) {
                // duplicate across the inputs, keep the first copy
                continue;
            }
            if !self.fits(item.payload.len()) {
                bail!(
                    "merged container {} cannot absorb chunk {}",
                    self.primary_id,
                    item.key
                );
            }
            self.by_key.insert(item.key, self.items.len());
            let mut item = item.clone();
            if item.original_id == 0 {
                item.original_id = other.primary_id;
            }
            self.items.push(item);
        }
        Ok(dropped)
    }

    pub fn serialize(&self, compress: bool) -> Result<Vec<u8>, Error> {
        use dbs_tools::io::WriteLeExt;

        if self.items.len() > self.max_items() {
            bail!("container {} exceeds the directory area", self.primary_id);
        }

        let mut directory = Vec::with_capacity(self.items.len() * DIRECTORY_ENTRY_SIZE);
        let mut payload_area: Vec<u8> = Vec::new();
        let payload_base = HEADER_SIZE
            + self.secondary_ids.len() * 8
            + self.items.len() * DIRECTORY_ENTRY_SIZE;

        for item in &self.items {
            let offset = payload_base + payload_area.len();
            let (stored, compressed) = if compress && !item.payload.is_empty() {
                let packed = zstd::bulk::compress(&item.payload, 1)?;
                // only use compression if the result is shorter
                if packed.len() < item.payload.len() {
                    (packed, true)
                } else {
                    (item.payload.clone(), false)
                }
            } else {
                (item.payload.clone(), false)
            };

            let mut flags = 0u8;
            if item.is_indexed {
                flags |= ITEM_FLAG_INDEXED;
            }
            if item.is_deleted {
                flags |= ITEM_FLAG_DELETED;
            }
            if compressed {
                flags |= ITEM_FLAG_COMPRESSED;
            }

            directory.write_le_u8(item.key.size() as u8)?;
            let mut key_buf = [0u8; MAX_FINGERPRINT_SIZE];
            key_buf[..item.key.size()].copy_from_slice(item.key.as_bytes());
            directory.extend_from_slice(&key_buf);
            directory.write_le_u32(item.raw_size)?;
            directory.write_le_u32(stored.len() as u32)?;
            directory.write_le_u64(item.original_id)?;
            directory.write_le_u8(flags)?;
            directory.write_le_u32(offset as u32)?;

            payload_area.extend_from_slice(&stored);
        }

        let total_size =
            payload_base + payload_area.len() + TRAILER_SIZE;
        if total_size > self.capacity {
            bail!(
                "container {} serializes to {} bytes, capacity is {}",
                self.primary_id,
                total_size,
                self.capacity
            );
        }

        let mut data = Vec::with_capacity(total_size);
        data.extend_from_slice(&CONTAINER_MAGIC_1_0);
        data.write_le_u32(total_size as u32)?;
        data.write_le_u64(self.primary_id)?;
        data.write_le_u16(self.secondary_ids.len() as u16)?;
        data.write_le_u32(self.items.len() as u32)?;
        data.write_le_u64(self.active_data_size())?;
        for id in &self.secondary_ids {
            data.write_le_u64(*id)?;
        }
        data.extend_from_slice(&directory);
        data.extend_from_slice(&payload_area);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data);
        data.write_le_u32(hasher.finalize())?;

        Ok(data)
    }

    pub fn deserialize(data: &[u8], capacity: usize) -> Result<Self, Error> {
        use dbs_tools::io::ReadLeExt;

        if data.len() < HEADER_SIZE + TRAILER_SIZE {
            bail!("container blob too small ({} bytes)", data.len());
        }
        if data[0..8] != CONTAINER_MAGIC_1_0 {
            bail!("container blob has unknown magic number");
        }

        let mut reader = &data[8..];
        let total_size = reader.read_le_u32()? as usize;
        if total_size < HEADER_SIZE + TRAILER_SIZE || total_size > data.len() {
            bail!("container blob has invalid size {total_size}");
        }

        let stored_crc =
            u32::from_le_bytes(data[total_size - 4..total_size].try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[..total_size - 4]);
        if hasher.finalize() != stored_crc {
            bail!("container blob has wrong CRC checksum");
        }

        let primary_id = reader.read_le_u64()?;
        let secondary_count = reader.read_le_u16()? as usize;
        let item_count = reader.read_le_u32()? as usize;
        let _active_data_size = reader.read_le_u64()?;

        let mut container = Container::new(primary_id, capacity);
        for _ in 0..secondary_count {
            container.secondary_ids.insert(reader.read_le_u64()?);
        }

        for pos in 0..item_count {
            let key_size = reader.read_le_u8()? as usize;
            let key_buf = reader.read_exact_vec(MAX_FINGERPRINT_SIZE)?;
            if key_size == 0 || key_size > MAX_FINGERPRINT_SIZE {
                bail!("container {primary_id} item {pos} has bad key size {key_size}");
            }
            let key = Fingerprint::new(&key_buf[..key_size])?;
            let raw_size = reader.read_le_u32()?;
            let compressed_size = reader.read_le_u32()? as usize;
            let original_id = reader.read_le_u64()?;
            let flags = reader.read_le_u8()?;
            let offset = reader.read_le_u32()? as usize;

            if offset + compressed_size > total_size - TRAILER_SIZE {
                bail!("container {primary_id} item {pos} payload out of bounds");
            }
            let stored = &data[offset..offset + compressed_size];
            let payload = if flags & ITEM_FLAG_COMPRESSED != 0 {
                let unpacked = zstd::bulk::decompress(stored, raw_size as usize)?;
                if unpacked.len() != raw_size as usize {
                    bail!("container {primary_id} item {pos} decompresses to wrong size");
                }
                unpacked
            } else {
                if compressed_size != raw_size as usize {
                    bail!("container {primary_id} item {pos} has inconsistent sizes");
                }
                stored.to_vec()
            };

            container.by_key.insert(key, container.items.len());
            container.items.push(ContainerItem {
                key,
                raw_size,
                original_id,
                is_indexed: flags & ITEM_FLAG_INDEXED != 0,
                is_deleted: flags & ITEM_FLAG_DELETED != 0,
                payload,
            });
        }

        Ok(container)
    }

    /// Deserialize and verify the id the caller expects.
    pub fn deserialize_checked(
        data: &[u8],
        capacity: usize,
        expected_primary: u64,
    ) -> Result<Self, Error> {
        let container = Self::deserialize(data, capacity)
            .map_err(|err| format_err!("reading container {expected_primary} - {err}"))?;
        if container.primary_id != expected_primary
            && !container.secondary_ids.contains(&expected_primary)
        {
            bail!(
                "container {} read where {} was expected",
                container.primary_id,
                expected_primary
            );
        }
        Ok(container)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::new(&[byte; 20]).unwrap()
    }

    #[test]
    fn serialize_roundtrip() {
        let mut container = Container::new(7, 256 * 1024);
        container.add_item(fp(1), vec![0xaa; 4000], true).unwrap();
        container.add_item(fp(2), b"short".to_vec(), true).unwrap();
        container.add_item(fp(3), Vec::new(), false).unwrap();
        container.add_secondary_id(3);
        container.delete_item(&fp(2));

        let data = container.serialize(true).unwrap();
        assert!(data.len() <= 256 * 1024);

        let back = Container::deserialize(&data, 256 * 1024).unwrap();
        assert_eq!(back.primary_id(), 7);
        assert_eq!(back.secondary_ids().len(), 1);
        assert_eq!(back.item_count(), 3);
        assert_eq!(back.active_item_count(), 2);
        assert_eq!(back.find_item(&fp(1)).unwrap().payload(), &[0xaa; 4000][..]);
        assert!(back.find_item(&fp(2)).is_none()); // deleted
        assert_eq!(back.find_item(&fp(3)).unwrap().payload(), b"");
    }

    #[test]
    fn crc_detects_corruption() {
        let mut container = Container::new(1, 64 * 1024);
        container.add_item(fp(9), vec![7u8; 100], true).unwrap();
        let mut data = container.serialize(false).unwrap();
        let flip = data.len() / 2;
        data[flip] ^= 0xff;
        assert!(Container::deserialize(&data, 64 * 1024).is_err());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut container = Container::new(1, 8 * 1024);
        container.add_item(fp(1), vec![1u8; 4000], true).unwrap();
        assert!(!container.fits(64 * 1024));
        assert!(container.add_item(fp(2), vec![2u8; 64 * 1024], true).is_err());
    }

    #[test]
    fn absorb_preserves_original_ids_and_drops_garbage() {
        let mut a = Container::new(1, 256 * 1024);
        a.add_item(fp(1), vec![1u8; 100], true).unwrap();
        let mut b = Container::new(2, 256 * 1024);
        b.add_item(fp(2), vec![2u8; 100], true).unwrap();
        b.add_item(fp(3), vec![3u8; 100], true).unwrap();

        let mut merged = Container::new(2, 256 * 1024);
        merged.add_secondary_id(1);
        let dropped = merged.absorb(&a, &mut |_| true).unwrap();
        assert!(dropped.is_empty());
        let dropped = merged.absorb(&b, &mut |key| *key != fp(3)).unwrap();
        assert_eq!(dropped, vec![fp(3)]);

        assert_eq!(merged.active_item_count(), 2);
        assert_eq!(merged.find_item(&fp(1)).unwrap().original_id, 1);
        assert_eq!(merged.find_item(&fp(2)).unwrap().original_id, 2);
    }
}
