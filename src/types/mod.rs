//! Core types for Troupe.

pub mod content;

pub use content::*;
