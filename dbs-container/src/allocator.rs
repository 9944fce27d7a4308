use anyhow::{bail, Error};

/// Tracks which (file, slot) coordinates hold containers.
///
/// The bitmap is not persisted; the storage rebuilds it at open from the
/// meta-data index and the replayed `ContainerOpened` events.
pub struct ContainerAllocator {
    files: Vec<FileSlots>,
}

struct FileSlots {
    used: Vec<bool>,
    free_count: u64,
}

impl ContainerAllocator {
    pub fn new(file_count: u16, slots_per_file: u64) -> Self {
        let files = (0..file_count)
            .map(|_| FileSlots {
                used: vec![false; slots_per_file as usize],
                free_count: slots_per_file,
            })
            .collect();
        Self { files }
    }

    pub fn free_slots(&self) -> u64 {
        self.files.iter().map(|f| f.free_count).sum()
    }

    pub fn total_slots(&self) -> u64 {
        self.files.iter().map(|f| f.used.len() as u64).sum()
    }

    /// Reserve the next free slot, preferring the file with the most room.
    pub fn allocate(&mut self) -> Option<(u16, u64)> {
        let (file_index, file) = self
            .files
            .iter_mut()
            .enumerate()
            .max_by_key(|(_, f)| f.free_count)?;
        if file.free_count == 0 {
            return None;
        }
        let slot = file.used.iter().position(|used| !used)?;
        file.used[slot] = true;
        file.free_count -= 1;
        Some((file_index as u16, slot as u64))
    }

    /// Mark a slot used during open/replay. Idempotent.
    pub fn mark_used(&mut self, file_index: u16, slot: u64) -> Result<(), Error> {
        let file = self.file_mut(file_index, slot)?;
        if !file.used[slot as usize] {
            file.used[slot as usize] = true;
            file.free_count -= 1;
        }
        Ok(())
    }

    /// Release a slot after a merge, delete or failed commit. Idempotent.
    pub fn mark_free(&mut self, file_index: u16, slot: u64) -> Result<(), Error> {
        let file = self.file_mut(file_index, slot)?;
        if file.used[slot as usize] {
            file.used[slot as usize] = false;
            file.free_count += 1;
        }
        Ok(())
    }

    pub fn is_used(&self, file_index: u16, slot: u64) -> bool {
        self.files
            .get(file_index as usize)
            .map(|f| f.used.get(slot as usize).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    fn file_mut(&mut self, file_index: u16, slot: u64) -> Result<&mut FileSlots, Error> {
        let count = self.files.len();
        let file = self
            .files
            .get_mut(file_index as usize)
            .ok_or_else(|| anyhow::format_err!("file index {file_index} out of range ({count} files)"))?;
        if slot as usize >= file.used.len() {
            bail!("slot {slot} out of range for file {file_index}");
        }
        Ok(file)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_free_cycle() {
        let mut allocator = ContainerAllocator::new(2, 4);
        assert_eq!(allocator.free_slots(), 8);

        let mut taken = Vec::new();
        while let Some(coords) = allocator.allocate() {
            taken.push(coords);
        }
        assert_eq!(taken.len(), 8);
        assert_eq!(allocator.free_slots(), 0);

        allocator.mark_free(taken[3].0, taken[3].1).unwrap();
        allocator.mark_free(taken[3].0, taken[3].1).unwrap(); // idempotent
        assert_eq!(allocator.free_slots(), 1);
        assert_eq!(allocator.allocate(), Some(taken[3]));
    }

    #[test]
    fn rebuild_marks_used() {
        let mut allocator = ContainerAllocator::new(1, 4);
        allocator.mark_used(0, 2).unwrap();
        allocator.mark_used(0, 2).unwrap();
        assert_eq!(allocator.free_slots(), 3);
        for _ in 0..3 {
            let (_, slot) = allocator.allocate().unwrap();
            assert_ne!(slot, 2);
        }
        assert!(allocator.mark_used(0, 9).is_err());
    }
}
