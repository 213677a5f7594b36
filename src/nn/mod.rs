//! Embedding losses

pub mod losses;

pub use losses::*;
