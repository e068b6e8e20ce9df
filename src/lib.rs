//! Conformer vision backbone in pure Rust.
//!
//! A candle-based implementation of Conformer, a dual-branch backbone that
//! runs a ResNet-style convolutional branch and a ViT-style token branch side
//! by side and couples them at every stage. Loads safetensors or PyTorch
//! checkpoints directly.
//!
//! ## Architecture
//!
//! ```text
//! image → stem (conv 7×7/2, BN, ReLU, maxpool) ──┬→ conv_1 ─────────→ x
//!                                                └→ patch conv → trans_1 → x_t
//!                          ↓
//!        conv_trans_2 … conv_trans_{depths}   (x ⇄ x_t via FCU down / up)
//!                          ↓
//!        per requested stage: (pooled conv features, class token or mean token)
//! ```
//!
//! ## Modules
//!
//! - [`config`]: architecture presets, construction options, stage layout
//! - [`model`]: the backbone and its building blocks
//! - [`checkpoint`]: safetensors save, non-strict checkpoint loading

pub mod checkpoint;
pub mod config;
pub mod model;

mod error;

pub use config::{Arch, ArchSettings, ConformerConfig};
pub use error::{Error, Result};
pub use model::conformer::{Conformer, StageOutput};
