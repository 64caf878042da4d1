//! 优化引擎：预测排序、退火调度与固定容量的 Top-K 桶。

pub mod annealer;
pub mod bucket;
pub mod priority;
pub mod pruner;

pub use annealer::{Annealer, ProbeOutcome, Prober};
