// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::decoders::h264::dpb::Dpb;
use crate::decoders::h264::headers::Pps;
use crate::decoders::h264::headers::Slice;
use crate::decoders::h264::headers::Sps;
use crate::decoders::h264::picture::PictureData;

pub type Result<T> = std::result::Result<T, crate::decoders::StatelessBackendError>;

#[cfg(test)]
pub mod dummy;

/// Trait for stateless decoder backends. The decoder takes care of the
/// decoding order and of reference management, and calls into the backend to
/// reconstruct the pictures and to present them.
///
/// A reference picture list entry of `None` means that no picture is available
/// for that index.
pub trait StatelessDecoderBackend {
    /// Called when a new SPS is activated. `dpb_size` is the number of
    /// pictures the backend must be able to hold at once.
    fn new_sequence(&mut self, sps: &Sps, dpb_size: usize) -> Result<()>;

    /// Called when the decoder determines that a frame was found.
    fn new_picture(&mut self, picture: &PictureData, timestamp: u64) -> Result<()>;

    /// Called once per picture, after its POC and the pic nums of the DPB have
    /// been computed and before its first slice is decoded.
    fn start_picture(
        &mut self,
        picture: &PictureData,
        sps: &Sps,
        pps: &Pps,
        dpb: &Dpb,
        slice: &Slice,
    ) -> Result<()>;

    /// Called to dispatch a decode operation to the backend.
    fn decode_slice(
        &mut self,
        slice: &Slice,
        sps: &Sps,
        pps: &Pps,
        ref_pic_list0: &[Option<&PictureData>],
        ref_pic_list1: &[Option<&PictureData>],
    ) -> Result<()>;

    /// Called when every slice of `picture` has been submitted.
    fn end_picture(&mut self, picture: &PictureData) -> Result<()>;

    /// Called with the pictures to present, in output order. Pictures that
    /// are still referenced are handed over as copies.
    fn output_picture(&mut self, timestamp: u64, picture: PictureData) -> Result<()>;
}
