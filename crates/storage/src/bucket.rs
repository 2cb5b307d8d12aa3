//! Bucket-variable block codec
//!
//! An immutable run of sorted `(key, value)` pairs inside a fixed-size
//! page, prefix-compressing each key against its predecessor:
//!
//! ```text
//!   header (8 bytes):  count | free-offset | index-offset | reserved
//!   entries (upward):  kprefix  ksuffix_len  vsize   ksuffix  value
//!                      \------ LEB128 varints ------/
//!   index (downward):  u16 entry offsets, one per entry, from page end
//! ```
//!
//! Every 16th entry is a restart point encoded with `kprefix == 0`, so a
//! binary-search probe can materialize any key from the nearest restart
//! without decoding the whole page.

use byteorder::{ByteOrder, LittleEndian};
use raleighsl_core::bytes::shared_prefix;
use raleighsl_core::{Errno, RslResult};

const HEADER_SIZE: usize = 8;
const RESTART_INTERVAL: usize = 16;

fn varint_len(mut v: u32) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

fn write_varint(buf: &mut [u8], mut v: u32) -> usize {
    let mut i = 0;
    while v >= 0x80 {
        buf[i] = (v as u8 & 0x7f) | 0x80;
        v >>= 7;
        i += 1;
    }
    buf[i] = v as u8;
    i + 1
}

fn read_varint(buf: &[u8], off: usize) -> (u32, usize) {
    let mut v = 0u32;
    let mut shift = 0;
    let mut i = off;
    loop {
        let byte = buf[i];
        v |= ((byte & 0x7f) as u32) << shift;
        i += 1;
        if byte & 0x80 == 0 {
            return (v, i);
        }
        shift += 7;
    }
}

/// Append-only encoder for a bucket page
pub struct BucketBuilder {
    buf: Vec<u8>,
    count: usize,
    free: usize,
    prev_key: Vec<u8>,
}

impl BucketBuilder {
    /// Start an empty page of `size` bytes
    ///
    /// Offsets are 16-bit, so a page holds at most 64 KiB minus one byte.
    pub fn new(size: usize) -> Self {
        assert!(size >= HEADER_SIZE + 2 && size <= u16::MAX as usize);
        BucketBuilder {
            buf: vec![0u8; size],
            count: 0,
            free: HEADER_SIZE,
            prev_key: Vec::new(),
        }
    }

    /// Bytes still usable for entries and their index slots
    pub fn available(&self) -> usize {
        let index_off = self.buf.len() - 2 * self.count;
        index_off - self.free
    }

    /// Entries appended so far
    pub fn count(&self) -> usize {
        self.count
    }

    /// Append the next entry; keys must arrive in strictly ascending order
    ///
    /// Fails with `PageFull` (leaving the page unchanged) when the encoded
    /// entry plus its index slot would not fit.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> RslResult<()> {
        debug_assert!(
            self.count == 0 || self.prev_key.as_slice() < key,
            "bucket keys must be strictly ascending"
        );

        let kprefix = if self.count % RESTART_INTERVAL == 0 {
            0
        } else {
            shared_prefix(&self.prev_key, key)
        };
        let ksuffix = &key[kprefix..];

        let entry_len = varint_len(kprefix as u32)
            + varint_len(ksuffix.len() as u32)
            + varint_len(value.len() as u32)
            + ksuffix.len()
            + value.len();
        if entry_len + 2 > self.available() {
            return Err(Errno::PageFull);
        }

        let mut off = self.free;
        off += write_varint(&mut self.buf[off..], kprefix as u32);
        off += write_varint(&mut self.buf[off..], ksuffix.len() as u32);
        off += write_varint(&mut self.buf[off..], value.len() as u32);
        self.buf[off..off + ksuffix.len()].copy_from_slice(ksuffix);
        off += ksuffix.len();
        self.buf[off..off + value.len()].copy_from_slice(value);
        off += value.len();

        let slot = self.buf.len() - 2 * (self.count + 1);
        LittleEndian::write_u16(&mut self.buf[slot..slot + 2], self.free as u16);

        self.free = off;
        self.count += 1;
        self.prev_key.clear();
        self.prev_key.extend_from_slice(key);
        Ok(())
    }

    /// Seal the page
    pub fn finish(mut self) -> Box<[u8]> {
        let index_off = self.buf.len() - 2 * self.count;
        LittleEndian::write_u16(&mut self.buf[0..2], self.count as u16);
        LittleEndian::write_u16(&mut self.buf[2..4], self.free as u16);
        LittleEndian::write_u16(&mut self.buf[4..6], index_off as u16);
        LittleEndian::write_u16(&mut self.buf[6..8], 0);
        self.buf.into_boxed_slice()
    }
}

/// One decoded entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketItem {
    /// Materialized key bytes
    pub key: Vec<u8>,
    /// Offset of the value inside the page
    pub value_off: usize,
    /// Value length
    pub value_len: usize,
}

/// Read-only view over a sealed bucket page
#[derive(Clone, Copy)]
pub struct BucketPage<'a> {
    data: &'a [u8],
}

struct RawEntry {
    kprefix: usize,
    ksuffix: (usize, usize),
    value: (usize, usize),
}

impl<'a> BucketPage<'a> {
    /// Wrap a sealed page
    pub fn new(data: &'a [u8]) -> Self {
        debug_assert!(data.len() >= HEADER_SIZE);
        BucketPage { data }
    }

    /// Entry count
    pub fn count(&self) -> usize {
        LittleEndian::read_u16(&self.data[0..2]) as usize
    }

    /// Bytes that were still free when the page was sealed
    pub fn available(&self) -> usize {
        let free = LittleEndian::read_u16(&self.data[2..4]) as usize;
        let index_off = LittleEndian::read_u16(&self.data[4..6]) as usize;
        index_off - free
    }

    fn entry_off(&self, idx: usize) -> usize {
        let slot = self.data.len() - 2 * (idx + 1);
        LittleEndian::read_u16(&self.data[slot..slot + 2]) as usize
    }

    fn decode(&self, off: usize) -> RawEntry {
        let (kprefix, off) = read_varint(self.data, off);
        let (ksuffix_len, off) = read_varint(self.data, off);
        let (vsize, off) = read_varint(self.data, off);
        RawEntry {
            kprefix: kprefix as usize,
            ksuffix: (off, ksuffix_len as usize),
            value: (off + ksuffix_len as usize, vsize as usize),
        }
    }

    /// Key of a restart entry (self-contained, `kprefix == 0`)
    fn restart_key(&self, restart: usize) -> &'a [u8] {
        let raw = self.decode(self.entry_off(restart * RESTART_INTERVAL));
        debug_assert_eq!(raw.kprefix, 0);
        &self.data[raw.ksuffix.0..raw.ksuffix.0 + raw.ksuffix.1]
    }

    /// Find `key`; returns the value's `(offset, len)` inside the page
    pub fn lookup(&self, key: &[u8]) -> Option<(usize, usize)> {
        let count = self.count();
        if count == 0 {
            return None;
        }

        // binary search over self-contained restart entries
        let restarts = (count + RESTART_INTERVAL - 1) / RESTART_INTERVAL;
        let (mut lo, mut hi) = (0usize, restarts);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.restart_key(mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            return None;
        }
        let run_start = (lo - 1) * RESTART_INTERVAL;
        let run_end = (run_start + RESTART_INTERVAL).min(count);

        // materialize keys along the run
        let mut current = Vec::new();
        for idx in run_start..run_end {
            let raw = self.decode(self.entry_off(idx));
            current.truncate(raw.kprefix);
            current.extend_from_slice(&self.data[raw.ksuffix.0..raw.ksuffix.0 + raw.ksuffix.1]);
            match current.as_slice().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Some(raw.value),
                std::cmp::Ordering::Greater => return None,
            }
        }
        None
    }

    /// Iterate entries in key order from the first entry
    pub fn iter(&self) -> BucketIter<'a> {
        BucketIter {
            page: *self,
            pos: 0,
            key: Vec::new(),
        }
    }

    /// Iterate from the first key `>= key` (or `> key` when not inclusive)
    pub fn iter_from(&self, key: &[u8], inclusive: bool) -> BucketIter<'a> {
        let mut iter = self.iter();
        iter.seek(key, inclusive);
        iter
    }
}

/// Sequential decoder maintaining the prefix chain
pub struct BucketIter<'a> {
    page: BucketPage<'a>,
    pos: usize,
    key: Vec<u8>,
}

impl<'a> BucketIter<'a> {
    fn seek(&mut self, key: &[u8], inclusive: bool) {
        let count = self.page.count();
        if count == 0 {
            self.pos = 0;
            return;
        }
        // start from the last restart whose key could precede the target
        let restarts = (count + RESTART_INTERVAL - 1) / RESTART_INTERVAL;
        let (mut lo, mut hi) = (0usize, restarts);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.page.restart_key(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.pos = lo.saturating_sub(1) * RESTART_INTERVAL;
        self.key.clear();

        while self.pos < count {
            let raw = self.page.decode(self.page.entry_off(self.pos));
            self.key.truncate(raw.kprefix);
            self.key
                .extend_from_slice(&self.page.data[raw.ksuffix.0..raw.ksuffix.0 + raw.ksuffix.1]);
            let past = if inclusive {
                self.key.as_slice() >= key
            } else {
                self.key.as_slice() > key
            };
            if past {
                // leave the prefix chain positioned just before this entry
                self.key.truncate(raw.kprefix);
                return;
            }
            self.pos += 1;
        }
    }
}

impl<'a> Iterator for BucketIter<'a> {
    type Item = BucketItem;

    fn next(&mut self) -> Option<BucketItem> {
        if self.pos >= self.page.count() {
            return None;
        }
        let raw = self.page.decode(self.page.entry_off(self.pos));
        self.key.truncate(raw.kprefix);
        self.key
            .extend_from_slice(&self.page.data[raw.ksuffix.0..raw.ksuffix.0 + raw.ksuffix.1]);
        self.pos += 1;
        Some(BucketItem {
            key: self.key.clone(),
            value_off: raw.value.0,
            value_len: raw.value.1,
        })
    }
}
