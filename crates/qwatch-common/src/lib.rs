//! Primitive types shared by every qwatch crate.

pub mod id;
pub mod types;
