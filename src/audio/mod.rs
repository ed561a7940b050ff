//! # Audio Module
//!
//! Per-guild playback engine.
//!
//! ## Architecture
//!
//! ### [`queue`] - Playback state machine
//! - FIFO backlog plus at most one current track
//! - Pause, loop, volume, seek and shuffle
//! - Records lifecycle notices in transition order
//!
//! ### [`player`] - Playback registry
//! - One locked context per guild, created on first use
//! - Drives the transport and reacts to track end events
//! - Idle contexts are evicted by the maintenance task
//!
//! ### [`voice`] - Songbird transport
//! - Feeds decoded streams into the voice call as live input
//!
//! ### [`track`] - Track model
//! - Move-only decoded stream, owning decode process, play clock

pub mod player;
pub mod queue;
pub mod track;
pub mod voice;
