//! Immutable sorted-set blocks
//!
//! A block is one sealed bucket page plus its key range. Value lookups
//! hand out `ByteRef`s that point straight into the page; the block itself
//! is the byte provider, so a value reference keeps the whole block alive.

use raleighsl_core::bytes::{ByteRef, ByteSource};
use raleighsl_storage::bucket::{BucketBuilder, BucketPage};
use std::sync::Arc;

/// One immutable run of key/value pairs
pub struct SsetBlock {
    data: Box<[u8]>,
    first_key: ByteRef,
    last_key: ByteRef,
}

impl ByteSource for SsetBlock {
    fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl SsetBlock {
    /// First key stored in the block
    pub fn first_key(&self) -> &ByteRef {
        &self.first_key
    }

    /// Last key stored in the block
    pub fn last_key(&self) -> &ByteRef {
        &self.last_key
    }

    /// Bytes still free when the block was sealed
    pub fn available(&self) -> usize {
        BucketPage::new(&self.data).available()
    }

    /// Entry count
    pub fn count(&self) -> usize {
        BucketPage::new(&self.data).count()
    }

    /// True when `range` of this block intersects `[first, last]`
    pub fn overlaps(&self, first: &[u8], last: &[u8]) -> bool {
        !(self.last_key.as_slice() < first || self.first_key.as_slice() > last)
    }

    /// Find `key`; the returned value shares ownership with the block
    pub fn lookup(block: &Arc<SsetBlock>, key: &[u8]) -> Option<ByteRef> {
        let (off, len) = BucketPage::new(&block.data).lookup(key)?;
        Some(ByteRef::from_source(
            block.clone() as Arc<dyn ByteSource>,
            off,
            len,
        ))
    }

    /// Iterate `(key, value)` pairs from `start` (or the beginning)
    pub fn iter_from<'a>(
        block: &'a Arc<SsetBlock>,
        start: Option<&[u8]>,
        inclusive: bool,
    ) -> impl Iterator<Item = (ByteRef, ByteRef)> + 'a {
        let view = BucketPage::new(&block.data);
        let iter = match start {
            Some(key) => view.iter_from(key, inclusive),
            None => view.iter(),
        };
        let owner = block.clone();
        iter.map(move |item| {
            let key = ByteRef::copy_from(&item.key);
            let value = ByteRef::from_source(
                owner.clone() as Arc<dyn ByteSource>,
                item.value_off,
                item.value_len,
            );
            (key, value)
        })
    }
}

/// Accumulates sorted entries into sealed blocks of a fixed size
pub struct SsetBlockBuilder {
    block_size: usize,
    builder: Option<BucketBuilder>,
    first_key: Option<ByteRef>,
    last_key: Option<ByteRef>,
    sealed: Vec<Arc<SsetBlock>>,
}

impl SsetBlockBuilder {
    /// Builder emitting blocks of `block_size` bytes
    pub fn new(block_size: usize) -> Self {
        SsetBlockBuilder {
            block_size,
            builder: None,
            first_key: None,
            last_key: None,
            sealed: Vec::new(),
        }
    }

    fn seal_current(&mut self) {
        if let Some(builder) = self.builder.take() {
            if builder.count() == 0 {
                return;
            }
            let data = builder.finish();
            self.sealed.push(Arc::new(SsetBlock {
                data,
                first_key: self.first_key.take().expect("sealed block has a first key"),
                last_key: self.last_key.take().expect("sealed block has a last key"),
            }));
        }
    }

    /// Append the next entry, sealing and starting a new block on overflow
    pub fn push(&mut self, key: &ByteRef, value: &ByteRef) {
        loop {
            let builder = self
                .builder
                .get_or_insert_with(|| BucketBuilder::new(self.block_size));
            if builder.append(key.as_slice(), value.as_slice()).is_ok() {
                if self.first_key.is_none() {
                    self.first_key = Some(key.clone());
                }
                self.last_key = Some(key.clone());
                return;
            }
            // full block: seal it and retry on a fresh one
            assert!(
                builder.count() > 0,
                "a single entry must fit in a sorted-set block"
            );
            self.seal_current();
        }
    }

    /// Seal the trailing block and take the emitted sequence
    pub fn finish(mut self) -> Vec<Arc<SsetBlock>> {
        self.seal_current();
        self.sealed
    }
}
