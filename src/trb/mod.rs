//! # TRB: Transactional Red-Black Tree
//!
//! A copy-on-write red-black tree with transactional commit/rollback over a
//! paged node heap and an append-only key/value store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │        Tree / Txn (public API)       │
//! ├──────────────────────────────────────┤
//! │  CoW red-black algebra (tree.rs)     │
//! ├───────────────────┬──────────────────┤
//! │ NodeHeap (heap.rs)│ DataStore        │
//! │ 64-slot pages,    │ (store.rs)       │
//! │ bitmap alloc      │ 4 KiB log chunks │
//! └───────────────────┴──────────────────┘
//! ```
//!
//! The heap's per-page bitmaps make commit and rollback O(dirty pages): a
//! transaction's allocations and frees are folded into (or discarded from)
//! the committed image with a handful of word operations per touched page.
//! Payload bytes live in the append-only store; rollback truncates the store
//! back to the position snapshotted at `begin`.
//!
//! ## Module Organization
//!
//! - `heap`: packed node addresses, 64-slot pages, the node heap
//! - `store`: append-only chunked key/value records
//! - `tree`: copy-on-write balancing and the `Tree`/`Txn` surface

mod heap;
mod store;
mod tree;

pub use tree::{Tree, Txn};
