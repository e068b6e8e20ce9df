//! Model components.
//!
//! ## Components
//!
//! - [`conformer`]: stem, stage 1, fusion stages and pooled outputs
//! - [`conv_trans`]: one dual-branch fusion stage
//! - [`conv_block`]: bottleneck residual unit of the conv branch
//! - [`fcu`]: feature coupling units between the branches
//! - [`transformer`]: pre-norm encoder layer of the token branch
//! - [`drop`]: stochastic depth
//! - [`init`]: default parameter initialization

pub mod conformer;
pub mod conv_block;
pub mod conv_trans;
pub mod drop;
pub mod fcu;
pub mod init;
pub mod transformer;

/// Execution mode threaded through every forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    /// Dropout and drop-path are active.
    pub train: bool,
    /// BatchNorm normalizes with batch statistics and updates running stats.
    pub batch_stats: bool,
}

impl Phase {
    pub const EVAL: Self = Self {
        train: false,
        batch_stats: false,
    };

    /// Training mode; `norm_eval` keeps BatchNorm on running statistics.
    pub fn training(norm_eval: bool) -> Self {
        Self {
            train: true,
            batch_stats: !norm_eval,
        }
    }
}
