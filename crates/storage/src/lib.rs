//! Byte-level storage primitives for RaleighSL
//!
//! - `bucket`: prefix-compressed immutable key/value block codec
//! - `avl16`: self-versioning copy-on-write AVL tree in a fixed page
//! - `device`: block-device collaborator trait and in-memory device
//!
//! Both page layouts are self-describing; the engine above decides what
//! lives where.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod avl16;
pub mod bucket;
pub mod device;

pub use avl16::{Avl16Page, AvlTxn};
pub use bucket::{BucketBuilder, BucketIter, BucketPage};
pub use device::{BlockDevice, MemDevice};
