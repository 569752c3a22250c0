//! Tower layers for the publish path.

mod delay;
mod json;

pub use delay::{DelayUntil, DelayUntilLayer};
pub use json::{JsonLayer, JsonService};
