//! Query layer: the condition grammar, aggregators, time-range DSL, row
//! selection, and the search processor that folds chunk packs into result
//! rows.

pub mod aggregate;
pub mod condition;
pub mod processor;
pub mod selector;
pub mod time_range;

pub use condition::{Condition, HavingContext};
pub use processor::Processor;
