// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode-order management for H.264 streams.
//!
//! This crate takes already-parsed parameter sets and slice headers and takes
//! care of everything a stateless accelerator does not: picture order counts,
//! the decoded picture buffer, reference marking, reference picture lists and
//! the output order of decoded frames. Pixel reconstruction is delegated to a
//! [`decoders::h264::backends::StatelessDecoderBackend`].

pub mod decoders;

use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Returns the number of 16x16 macroblocks covered by this resolution.
    pub fn num_macroblocks(&self) -> u32 {
        ((self.width + 15) / 16) * ((self.height + 15) / 16)
    }
}
