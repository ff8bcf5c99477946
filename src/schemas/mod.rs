//! Shared schemas for the events pipeline
//!
//! All structs serialize with `serde(rename_all = "camelCase")` so `fetch
//! --output json` matches the field names used by the rest of the product.

pub mod city;
pub mod event;

pub use city::*;
pub use event::*;
