//! # Audio Processing Module
//!
//! Everything the pipeline needs to turn an uploaded file into a re-timed MP3.
//!
//! ## Key Components:
//! - **Staging**: exclusive, self-deleting temp file for one upload
//! - **Codec**: the decode/encode boundary (symphonia in, LAME out)
//! - **Buffer**: decoded planar samples and the resampling primitive
//! - **Speed**: speed factor validation and the tape-style speed transform

pub mod buffer;   // Decoded samples + resampling
pub mod codec;    // AudioCodec trait and default implementation
pub mod decoder;  // Symphonia decoding
pub mod encoder;  // LAME MP3 encoding
pub mod speed;    // SpeedFactor and SpeedTransform
pub mod staging;  // TempAsset

pub use codec::{AudioCodec, EncodeTarget, FormatHint, SymphoniaLameCodec};
pub use speed::{SpeedFactor, SpeedLimits, SpeedTransform};
pub use staging::TempAsset;
