// Core modules: error model, row model, payload codecs, and step bounding.
pub mod error;
pub mod frame;
pub mod guard;
pub mod payload;
pub mod row;
