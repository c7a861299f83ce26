//! Type model

pub mod type_system;

pub use type_system::{compatible, CompatOptions, Type, DOUBLE_SIZE, WORD_SIZE};
