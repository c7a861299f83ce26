//! Middle-end module - Evaluation protocol and frame layout

pub mod frame;
pub mod protocol;

pub use frame::{FrameCalculator, FrameLayout};
