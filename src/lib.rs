//! Flotilla: layered, templated deployment configs for groups of chart units.
//!
//! Config files are merged in order, narrowed to a selection of units,
//! rendered through a two-pass template protocol, and then used to build
//! images, generate charts, and drive releases with bounded parallelism.

pub mod cli;
pub mod core;
pub mod runner;
pub mod schema;
pub mod template;
pub mod transport;
