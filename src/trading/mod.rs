//! Trading logic: risk policy and the copy-mirroring behavior.

mod copy_engine;
mod risk_guard;

pub use copy_engine::CopyBehaviorFactory;
