//! Shared-ownership immutable byte slices
//!
//! A `ByteRef` is a `(source, offset, length)` triple over a reference
//! counted byte provider. Cloning acquires the provider, dropping releases
//! it; when the last reference goes away the provider is freed. Providers
//! implement `ByteSource`, which lets a storage block hand out views into
//! its own payload without copying: the view keeps the whole block alive.
//!
//! Keys and values flow through the engine as `ByteRef`s; ordering and
//! equality are by byte content, never by provider identity.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Byte provider behind a `ByteRef`
///
/// The single hook returns the provider's full backing slice; a `ByteRef`
/// narrows it with its own offset and length.
pub trait ByteSource: Send + Sync {
    /// Full backing slice of this provider
    fn as_bytes(&self) -> &[u8];
}

impl ByteSource for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

impl ByteSource for Box<[u8]> {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

impl ByteSource for &'static [u8] {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

/// Shared immutable byte slice
///
/// Cheap to clone (one refcount bump). Empty refs carry no provider.
#[derive(Clone)]
pub struct ByteRef {
    src: Option<Arc<dyn ByteSource>>,
    off: usize,
    len: usize,
}

impl ByteRef {
    /// Empty slice with no provider
    pub fn empty() -> Self {
        ByteRef {
            src: None,
            off: 0,
            len: 0,
        }
    }

    /// Wrap an owned buffer
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        ByteRef {
            src: Some(Arc::new(data)),
            off: 0,
            len,
        }
    }

    /// Copy a borrowed slice into a new provider
    pub fn copy_from(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// View a sub-range of an existing provider
    ///
    /// # Panics
    /// Panics if `off + len` exceeds the provider's backing slice.
    pub fn from_source(src: Arc<dyn ByteSource>, off: usize, len: usize) -> Self {
        assert!(off + len <= src.as_bytes().len());
        ByteRef {
            src: Some(src),
            off,
            len,
        }
    }

    /// The referenced bytes
    pub fn as_slice(&self) -> &[u8] {
        match &self.src {
            Some(src) => &src.as_bytes()[self.off..self.off + self.len],
            None => &[],
        }
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the slice is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Narrow this ref to a sub-range, sharing the same provider
    ///
    /// # Panics
    /// Panics if the range exceeds this ref's length.
    pub fn slice(&self, start: usize, len: usize) -> ByteRef {
        assert!(start + len <= self.len);
        ByteRef {
            src: self.src.clone(),
            off: self.off + start,
            len,
        }
    }
}

impl fmt::Debug for ByteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteRef({:?})", self.as_slice())
    }
}

impl PartialEq for ByteRef {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ByteRef {}

impl PartialOrd for ByteRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByteRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

impl std::hash::Hash for ByteRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state);
    }
}

impl Borrow<[u8]> for ByteRef {
    fn borrow(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<&[u8]> for ByteRef {
    fn from(data: &[u8]) -> Self {
        ByteRef::copy_from(data)
    }
}

impl From<Vec<u8>> for ByteRef {
    fn from(data: Vec<u8>) -> Self {
        ByteRef::from_vec(data)
    }
}

/// Length of the shared prefix of two byte slices
///
/// Used by the bucket codec to prefix-compress keys against their
/// predecessor.
pub fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let r = ByteRef::empty();
        assert!(r.is_empty());
        assert_eq!(r.as_slice(), b"");
    }

    #[test]
    fn test_content_equality_across_providers() {
        let a = ByteRef::copy_from(b"hello");
        let b = ByteRef::from_vec(b"hello".to_vec());
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn test_slice_shares_provider() {
        let r = ByteRef::copy_from(b"hello world");
        let w = r.slice(6, 5);
        assert_eq!(w.as_slice(), b"world");
        drop(r);
        // the provider stays alive through the narrowed view
        assert_eq!(w.as_slice(), b"world");
    }

    #[test]
    fn test_ordering_is_bytewise() {
        let a = ByteRef::copy_from(b"abc");
        let b = ByteRef::copy_from(b"abd");
        let c = ByteRef::copy_from(b"ab");
        assert!(a < b);
        assert!(c < a);
    }

    #[test]
    fn test_shared_prefix() {
        assert_eq!(shared_prefix(b"apple", b"applesauce"), 5);
        assert_eq!(shared_prefix(b"apple", b"banana"), 0);
        assert_eq!(shared_prefix(b"", b"x"), 0);
    }

    #[test]
    #[should_panic]
    fn test_slice_out_of_range() {
        let r = ByteRef::copy_from(b"ab");
        let _ = r.slice(1, 5);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn shared_prefix_is_maximal(
                a in prop::collection::vec(any::<u8>(), 0..32),
                b in prop::collection::vec(any::<u8>(), 0..32),
            ) {
                let n = shared_prefix(&a, &b);
                prop_assert_eq!(&a[..n], &b[..n]);
                prop_assert!(n == a.len().min(b.len()) || a[n] != b[n]);
            }

            #[test]
            fn ordering_matches_slice_ordering(
                a in prop::collection::vec(any::<u8>(), 0..16),
                b in prop::collection::vec(any::<u8>(), 0..16),
            ) {
                let ra = ByteRef::copy_from(&a);
                let rb = ByteRef::copy_from(&b);
                prop_assert_eq!(ra.cmp(&rb), a.cmp(&b));
            }
        }
    }
}
