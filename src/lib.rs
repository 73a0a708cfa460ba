//! # tridex — In-Memory Indexing Cores
//!
//! Three independent indexing structures behind one contract: byte keys to
//! byte values, ordered by unsigned lexicographic comparison.
//!
//! - [`Art`]: a concurrent adaptive radix tree. Readers are lock-free and
//!   validate per-node version counters; writers coordinate through short
//!   optimistic write locks. Node types adapt to fan-out (4/16/48/256).
//! - [`Surf`]: a succinct range filter. An immutable LOUDS-encoded trie
//!   with rank/select acceleration, approximate membership and range
//!   queries (false positives tunable via suffix bits, never false
//!   negatives), and a byte-stable serialization format.
//! - [`Tree`]: a transactional copy-on-write red-black tree over a paged
//!   node heap and an append-only data store; commit and rollback are
//!   O(dirty pages).
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┬──────────────────┬─────────────────┐
//! │      ART      │       SuRF       │       TRB       │
//! ├───────────────┼──────────────────┼─────────────────┤
//! │ adaptive nodes│ LOUDS dense +    │ CoW red-black   │
//! │ + optimistic  │ sparse, rank /   │ algebra         │
//! │ version locks │ select, suffixes ├─────────────────┤
//! │               ├──────────────────┤ paged node heap │
//! │               │ builder (sorted  │ + append-only   │
//! │               │ stream, cutoff)  │ data store      │
//! └───────────────┴──────────────────┴─────────────────┘
//! ```
//!
//! The cores share no state and no code paths; each is usable on its own.
//!
//! ## Quick Start
//!
//! ```
//! use tridex::{Art, Builder, SuffixType, Tree};
//!
//! # fn main() -> eyre::Result<()> {
//! let art = Art::new();
//! art.put(b"key", b"value");
//! assert_eq!(art.get(b"key"), Some(&b"value"[..]));
//!
//! let mut builder = Builder::new(4, SuffixType::Mixed, 4, 4)?;
//! builder.add(b"apple", b"\x00\x00\x00\x01")?;
//! builder.add(b"banana", b"\x00\x00\x00\x02")?;
//! let surf = builder.finish(16);
//! assert!(surf.get(b"apple").is_some());
//!
//! let tree = Tree::new();
//! let mut txn = tree.begin();
//! txn.insert(b"key", b"value");
//! txn.commit();
//! assert_eq!(tree.get(b"key").as_deref(), Some(&b"value"[..]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`art`]: lock-free-reader concurrent ordered map over byte keys
//! - [`surf`]: succinct immutable trie with approximate membership + range
//! - [`trb`]: copy-on-write red-black tree with transactional semantics

pub mod art;
pub mod surf;
pub mod trb;

pub use art::Art;
pub use surf::{Builder, Iter, Surf, SuffixType};
pub use trb::{Tree, Txn};
