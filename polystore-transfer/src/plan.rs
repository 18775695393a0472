//! Transfer planning

use chrono::{DateTime, Utc};
use polystore_core::Address;

/// One byte range of a segmented object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

impl Segment {
    /// Half-open byte range covered by this segment
    pub fn range(&self) -> (u64, u64) {
        (self.offset, self.offset + self.len)
    }
}

/// Splits `total` bytes into contiguous segments of at most `segment_size`
/// each. Objects that fit in one segment (and a `segment_size` of zero,
/// which disables segmentation) produce a single full-size segment.
pub fn plan_segments(total: u64, segment_size: u64) -> Vec<Segment> {
    if segment_size == 0 || total <= segment_size {
        return vec![Segment { index: 0, offset: 0, len: total }];
    }
    let mut segments = Vec::new();
    let mut offset = 0;
    while offset < total {
        let len = segment_size.min(total - offset);
        segments.push(Segment { index: segments.len(), offset, len });
        offset += len;
    }
    segments
}

/// One source-to-destination pairing within a transfer, with whatever the
/// source listing knew about the object
#[derive(Debug, Clone)]
pub struct TransferUnit {
    pub source: Address,
    pub dest: Address,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
}
