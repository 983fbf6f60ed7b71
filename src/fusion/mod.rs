//! Pattern passes
//!
//! Each pass is a self-contained rewrite rule: it scans anchor nodes of
//! one distinguishing op type, matches a fixed-shape subgraph by walking
//! producer/consumer edges a bounded number of hops, validates the
//! structural and attribute constraints, and replaces each match
//! atomically. Mismatches are expected during scanning and leave the
//! anchor untouched; a pass never mutates the graph except through
//! [`crate::graph::GraphModel::replace_subgraph`].

pub mod common;
pub mod fuse_attention;
pub mod fuse_embed_layer_norm;
pub mod fuse_gelu;
pub mod fuse_skip_layer_norm;

pub use common::{FusionPass, FusionStats};
pub use fuse_attention::FuseAttention;
pub use fuse_embed_layer_norm::FuseEmbedLayerNorm;
pub use fuse_gelu::FuseGeluFamily;
pub use fuse_skip_layer_norm::FuseSkipLayerNorm;
