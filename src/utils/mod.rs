//! Utility functions and helpers.

pub mod surt;
pub mod text;

pub use surt::to_surt;
pub use text::{remove_extra_spaces, shorten_text};
