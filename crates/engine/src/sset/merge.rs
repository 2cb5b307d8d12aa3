//! K-way merge over sorted key/value sources
//!
//! Feeds range scans and the sync pass. Sources are ordered by priority:
//! when several sources carry the same key, the lowest-indexed source wins
//! and the duplicates are consumed silently. The in-memory write buffer is
//! always registered before any block, so fresher data shadows older data.

use raleighsl_core::bytes::ByteRef;
use std::iter::Peekable;

/// One merged entry; `None` value is a tombstone from the write buffer
pub(crate) struct MergeItem {
    pub key: ByteRef,
    pub value: Option<ByteRef>,
}

type Source<'a> = Peekable<Box<dyn Iterator<Item = MergeItem> + 'a>>;

/// Priority-aware k-way merge
pub(crate) struct KWayMerge<'a> {
    sources: Vec<Source<'a>>,
}

impl<'a> KWayMerge<'a> {
    pub fn new() -> Self {
        KWayMerge {
            sources: Vec::new(),
        }
    }

    /// Register the next source; earlier sources win ties
    pub fn add(&mut self, source: Box<dyn Iterator<Item = MergeItem> + 'a>) {
        self.sources.push(source.peekable());
    }
}

impl<'a> Iterator for KWayMerge<'a> {
    type Item = MergeItem;

    fn next(&mut self) -> Option<MergeItem> {
        // find the smallest key; the first source holding it wins
        let mut winner: Option<(usize, ByteRef)> = None;
        for (idx, source) in self.sources.iter_mut().enumerate() {
            if let Some(item) = source.peek() {
                match &winner {
                    Some((_, best)) if *best <= item.key => {}
                    _ => winner = Some((idx, item.key.clone())),
                }
            }
        }
        let (winner_idx, key) = winner?;

        let item = self.sources[winner_idx].next().expect("peeked above");
        // consume shadowed duplicates from lower-priority sources
        for source in self.sources.iter_mut().skip(winner_idx + 1) {
            while let Some(next) = source.peek() {
                if next.key == key {
                    source.next();
                } else {
                    break;
                }
            }
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source<'a>(pairs: Vec<(&'a str, Option<&'a str>)>) -> Box<dyn Iterator<Item = MergeItem> + 'a> {
        Box::new(pairs.into_iter().map(|(k, v)| MergeItem {
            key: ByteRef::copy_from(k.as_bytes()),
            value: v.map(|v| ByteRef::copy_from(v.as_bytes())),
        }))
    }

    fn run(merge: KWayMerge) -> Vec<(String, Option<String>)> {
        merge
            .map(|item| {
                (
                    String::from_utf8(item.key.as_slice().to_vec()).unwrap(),
                    item.value
                        .map(|v| String::from_utf8(v.as_slice().to_vec()).unwrap()),
                )
            })
            .collect()
    }

    #[test]
    fn test_interleaved_merge() {
        let mut merge = KWayMerge::new();
        merge.add(source(vec![("a", Some("1")), ("c", Some("3"))]));
        merge.add(source(vec![("b", Some("2")), ("d", Some("4"))]));
        assert_eq!(
            run(merge),
            vec![
                ("a".into(), Some("1".into())),
                ("b".into(), Some("2".into())),
                ("c".into(), Some("3".into())),
                ("d".into(), Some("4".into())),
            ]
        );
    }

    #[test]
    fn test_first_source_shadows_duplicates() {
        let mut merge = KWayMerge::new();
        merge.add(source(vec![("k", Some("new")), ("z", None)]));
        merge.add(source(vec![("k", Some("old")), ("z", Some("stale"))]));
        assert_eq!(
            run(merge),
            vec![("k".into(), Some("new".into())), ("z".into(), None)]
        );
    }

    #[test]
    fn test_empty_sources() {
        let mut merge = KWayMerge::new();
        merge.add(source(vec![]));
        merge.add(source(vec![("x", Some("1"))]));
        assert_eq!(run(merge), vec![("x".into(), Some("1".into()))]);
    }
}
