//! # UI Module
//!
//! Text replies: duration formatting, status and queue messages, and
//! splitting of long replies into platform-sized chunks.

pub mod format;
pub mod split;

pub use split::split;
