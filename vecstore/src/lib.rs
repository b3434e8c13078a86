//! Dense-vector similarity search behind a replaceable trait.
//!
//! [`VecIndex`] addresses vectors by insertion position so callers can keep
//! side tables aligned 1:1 with the index. [`FlatIndex`] is the exact
//! brute-force implementation; [`new_index`] selects an implementation by
//! kind name.

pub mod distance;
pub mod error;
pub mod flat;
pub mod vecstore;

pub use distance::{cosine_similarity, euclidean_distance, inner_product, l2_normalize, normalized};
pub use error::VecError;
pub use flat::FlatIndex;
pub use vecstore::{new_index, IndexMetric, Neighbor, VecIndex};
