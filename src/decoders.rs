// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub mod h264;

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Errors returned to the caller of the decoder. Every variant but `Fatal` and
/// `Halted` leaves the decoder ready to accept the next NAL unit.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// A parameter set or slice header could not be used as given, e.g. it
    /// references a parameter set that was never received.
    #[error("unusable parameter set or slice header: {0:#}")]
    Parse(anyhow::Error),
    /// The stream violates a structural constraint. The NAL unit or the
    /// current picture has been dropped.
    #[error("invalid stream structure: {0:#}")]
    Structural(anyhow::Error),
    /// The backend failed to decode the current picture, or there was no room
    /// left to keep it. The current picture has been dropped.
    #[error("resource failure: {0:#}")]
    Resource(anyhow::Error),
    /// The decoder cannot continue, e.g. the backend rejected a new sequence.
    #[error("fatal decoding error: {0:#}")]
    Fatal(anyhow::Error),
    /// A previous fatal error stopped the decoder. Call `reset()` to resume.
    #[error("the decoder is halted after a fatal error")]
    Halted,
}

impl DecodeError {
    /// Whether this error stopped the decoder until the next reset.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Fatal(_) | DecodeError::Halted)
    }
}

#[derive(Error, Debug)]
pub enum StatelessBackendError {
    #[error("Not enough resources to proceed with the operation now.")]
    OutOfResources,
    #[error("This format is not supported.")]
    UnsupportedFormat,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How strictly the decoder follows the standard when inferring stream
/// properties that the bitstream leaves out.
///
/// Together with [`DecoderConfig::low_latency`] this selects when pictures
/// are bumped out of the DPB:
///
/// - `Strict`: only when the reorder depth is exceeded or the DPB is full,
///   with the reorder depth taken from the VUI or the DPB size.
/// - `Normal`: the same, but streams in profiles without B-frames are assumed
///   not to reorder, so their pictures leave as soon as they are decoded.
/// - either one with `low_latency`: pictures that the POC sequence shows
///   nothing can precede are bumped early as well.
///
/// There is no mode that outputs every picture right after decoding
/// regardless of POC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Compliance {
    /// Only infer what the standard allows.
    Strict,
    /// Assume streams without B-frames in profiles that cannot carry them
    /// never reorder.
    #[default]
    Normal,
}

/// Decoder configuration, usually loaded from the embedder's settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderConfig {
    pub compliance: Compliance,
    /// Output pictures as soon as the POC sequence suggests nothing will be
    /// inserted before them, instead of waiting for the DPB to fill up.
    pub low_latency: bool,
    /// Number of pictures to hold back after they become ready for output.
    pub output_delay: usize,
}
