//! Domain models for the chartlab system.

mod episode;
mod feature;
mod ids;
mod label;
mod task;

pub use episode::*;
pub use feature::*;
pub use ids::*;
pub use label::*;
pub use task::*;
