#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

mod aggregate;
pub mod comm;
pub mod cost;
pub mod exec;
mod instrument;
pub mod ir;
mod profile;
pub mod runtime;
pub mod storage;
pub mod timing;
pub mod trap;

pub use aggregate::{Analyzer, Breakdown, CallBreakdown, TimingReport};
pub use anyhow::Result;
pub use instrument::{num_edge_slots, BlockWeight, InstrumentationStrategy, Instrumenter};
pub use ir::Module;
pub use profile::{compare, Profile, ProfileInfo, TimedCall, TrapFormat, TrappedCall};
