//! File system helpers: shallow listings and filesystem-kind probing.

pub mod probe;
pub mod walker;
