//! Containers shipped with the crate.

pub mod block_vec;
