//! `SpaceManager` — byte ranges of the backing file.
//!
//! New regions are appended at a cursor that only moves forward. Ranges
//! handed back through `free()` go into an offset-ordered free list and are
//! merged with their neighbours; `alloc()` tries that list first-fit before
//! touching the cursor.

use offload_core::region::Region;

use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct SpaceManager {
    cursor: u64,
    /// offset → len, never overlapping, never adjacent.
    free: BTreeMap<u64, u64>,
}

impl SpaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `len` bytes.
    pub fn alloc(&mut self, len: u64) -> Region {
        let hit = self
            .free
            .iter()
            .find(|&(_, &free_len)| free_len >= len)
            .map(|(&offset, &free_len)| (offset, free_len));

        if let Some((offset, free_len)) = hit {
            self.free.remove(&offset);
            if free_len > len {
                self.free.insert(offset + len, free_len - len);
            }
            return Region::new(offset, len);
        }

        let region = Region::new(self.cursor, len);
        self.cursor += len;
        region
    }

    /// Return a region. Zero-length regions are ignored.
    pub fn free(&mut self, region: Region) {
        if region.len == 0 {
            return;
        }
        debug_assert!(region.end() <= self.cursor, "freeing {} beyond cursor {}", region, self.cursor);

        let mut offset = region.offset;
        let mut len = region.len;

        // Merge with the range ending exactly at our start.
        if let Some((&prev_off, &prev_len)) = self.free.range(..offset).next_back() {
            debug_assert!(prev_off + prev_len <= offset, "double free of {}", region);
            if prev_off + prev_len == offset {
                self.free.remove(&prev_off);
                offset = prev_off;
                len += prev_len;
            }
        }
        // Merge with the range starting exactly at our end.
        if let Some(next_len) = self.free.remove(&(region.end())) {
            len += next_len;
        }

        self.free.insert(offset, len);
    }

    /// End of the highest region ever handed out.
    #[inline]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Bytes below the cursor that are currently free.
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    /// Number of disjoint free ranges.
    pub fn fragments(&self) -> usize {
        self.free.len()
    }
}
