//! Submission and completion entry types.
//!
//! They are the *lingua franca* between the engine, the slot pool and the
//! backend drivers.

use std::fmt;
use std::os::unix::io::RawFd;

/// Caller-managed identity of one offloaded buffer.
///
/// At most one operation per key may be in flight. The key also names
/// the buffer's region in the backing file once it has been written.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RequestKey(pub u64);

impl RequestKey {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for RequestKey {
    #[inline]
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestKey({})", self.0)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a request slot.
///
/// Stored in io_uring's `user_data` field (and in the AIO control block
/// table) so a completion routes back to its slot without a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SlotId(pub u32);

impl SlotId {
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn as_user_data(self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub const fn from_user_data(data: u64) -> Self {
        Self(data as u32)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Direction of a transfer between memory and the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IoOp {
    /// File → memory.
    Read = 0,
    /// Memory → file.
    Write = 1,
}

impl IoOp {
    pub fn as_str(self) -> &'static str {
        match self {
            IoOp::Read => "read",
            IoOp::Write => "write",
        }
    }
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One positioned read or write handed to a driver.
///
/// `ptr` must stay valid for `len` bytes until the driver reports the
/// completion for `slot`.
#[derive(Debug, Clone, Copy)]
pub struct IoRequest {
    pub slot: SlotId,
    pub op: IoOp,
    pub fd: RawFd,
    pub offset: u64,
    pub ptr: *mut u8,
    pub len: usize,
}

// Safety: the pointer is only dereferenced by the kernel while the slot is
// in flight, and the engine keeps the owning buffer alive for that span.
unsafe impl Send for IoRequest {}

/// A completed I/O operation from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCompletion {
    /// The slot that was submitted.
    pub slot: SlotId,
    /// Bytes transferred, or negative errno.
    pub result: i64,
}

impl IoCompletion {
    #[inline]
    pub fn is_error(&self) -> bool {
        self.result < 0
    }

    /// Positive errno when the completion carries an error.
    #[inline]
    pub fn errno(&self) -> Option<i32> {
        if self.result < 0 {
            Some((-self.result) as i32)
        } else {
            None
        }
    }
}
