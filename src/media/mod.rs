//! Encoded media handling
//!
//! This module provides:
//! - Boundary marker lookup per encoder format
//! - Frame assembly from a continuous encoder byte stream

pub mod assembler;
pub mod format;

pub use assembler::FrameAssembler;
pub use format::{boundary_marker, is_split_format, SPLIT_FRAME_FORMATS};
