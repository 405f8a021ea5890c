//! Byte ranges in the backing file.

use std::fmt;

/// A byte range in the backing file holding one buffer's offloaded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub offset: u64,
    pub len: u64,
}

impl Region {
    #[inline]
    pub const fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// One past the last byte.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.offset + self.len
    }

    #[inline]
    pub const fn overlaps(&self, other: &Region) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap() {
        let a = Region::new(0, 4096);
        let b = Region::new(4096, 4096);
        let c = Region::new(2048, 4096);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert_eq!(b.end(), 8192);
    }
}
