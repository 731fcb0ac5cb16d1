// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation. It records every call it receives.

use anyhow::anyhow;

use crate::decoders::h264::backends::Result as StatelessBackendResult;
use crate::decoders::h264::backends::StatelessDecoderBackend;
use crate::decoders::h264::decoder::Decoder;
use crate::decoders::h264::dpb::Dpb;
use crate::decoders::h264::headers::Pps;
use crate::decoders::h264::headers::Slice;
use crate::decoders::h264::headers::Sps;
use crate::decoders::h264::picture::PictureData;
use crate::decoders::DecoderConfig;
use crate::decoders::StatelessBackendError;

/// A call received by the dummy backend. Pictures are identified by their
/// POC, reference list entries by the POC of the picture they point to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    NewSequence {
        dpb_size: usize,
    },
    NewPicture {
        timestamp: u64,
        frame_num: i32,
    },
    StartPicture {
        pic_order_cnt: i32,
        dpb_len: usize,
    },
    DecodeSlice {
        first_mb_in_slice: u32,
        ref_pic_list0: Vec<Option<i32>>,
        ref_pic_list1: Vec<Option<i32>>,
    },
    EndPicture {
        pic_order_cnt: i32,
    },
    Output {
        timestamp: u64,
        pic_order_cnt: i32,
    },
}

/// Knobs to make the dummy backend fail its next calls.
#[derive(Debug, Default)]
pub struct Failures {
    pub new_sequence: bool,
    pub start_picture: bool,
    pub decode_slice: bool,
    pub end_picture: bool,
}

#[derive(Debug, Default)]
pub struct Backend {
    pub events: Vec<Event>,
    pub outputs: Vec<PictureData>,
    pub fail: Failures,
}

impl Backend {
    pub fn new() -> Self {
        Default::default()
    }

    /// POCs of the output pictures, in output order.
    pub fn output_pocs(&self) -> Vec<i32> {
        self.outputs.iter().map(|p| p.pic_order_cnt).collect()
    }

    /// Timestamps of the output pictures, in output order.
    pub fn output_timestamps(&self) -> Vec<u64> {
        self.outputs.iter().map(|p| p.timestamp).collect()
    }

    pub fn decoded_slices(&self) -> impl Iterator<Item = &Event> {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::DecodeSlice { .. }))
    }

    fn fail_if(fail: bool, what: &str) -> StatelessBackendResult<()> {
        if fail {
            Err(StatelessBackendError::Other(anyhow!("{} failed", what)))
        } else {
            Ok(())
        }
    }
}

fn pocs(list: &[Option<&PictureData>]) -> Vec<Option<i32>> {
    list.iter().map(|p| p.map(|p| p.pic_order_cnt)).collect()
}

impl StatelessDecoderBackend for Backend {
    fn new_sequence(&mut self, _: &Sps, dpb_size: usize) -> StatelessBackendResult<()> {
        if self.fail.new_sequence {
            return Err(StatelessBackendError::UnsupportedFormat);
        }

        self.events.push(Event::NewSequence { dpb_size });
        Ok(())
    }

    fn new_picture(&mut self, picture: &PictureData, timestamp: u64) -> StatelessBackendResult<()> {
        self.events.push(Event::NewPicture {
            timestamp,
            frame_num: picture.frame_num,
        });
        Ok(())
    }

    fn start_picture(
        &mut self,
        picture: &PictureData,
        _: &Sps,
        _: &Pps,
        dpb: &Dpb,
        _: &Slice,
    ) -> StatelessBackendResult<()> {
        Self::fail_if(self.fail.start_picture, "start_picture")?;

        self.events.push(Event::StartPicture {
            pic_order_cnt: picture.pic_order_cnt,
            dpb_len: dpb.len(),
        });
        Ok(())
    }

    fn decode_slice(
        &mut self,
        slice: &Slice,
        _: &Sps,
        _: &Pps,
        ref_pic_list0: &[Option<&PictureData>],
        ref_pic_list1: &[Option<&PictureData>],
    ) -> StatelessBackendResult<()> {
        if self.fail.decode_slice {
            return Err(StatelessBackendError::OutOfResources);
        }

        self.events.push(Event::DecodeSlice {
            first_mb_in_slice: slice.header.first_mb_in_slice,
            ref_pic_list0: pocs(ref_pic_list0),
            ref_pic_list1: pocs(ref_pic_list1),
        });
        Ok(())
    }

    fn end_picture(&mut self, picture: &PictureData) -> StatelessBackendResult<()> {
        Self::fail_if(self.fail.end_picture, "end_picture")?;

        self.events.push(Event::EndPicture {
            pic_order_cnt: picture.pic_order_cnt,
        });
        Ok(())
    }

    fn output_picture(
        &mut self,
        timestamp: u64,
        picture: PictureData,
    ) -> StatelessBackendResult<()> {
        self.events.push(Event::Output {
            timestamp,
            pic_order_cnt: picture.pic_order_cnt,
        });
        self.outputs.push(picture);
        Ok(())
    }
}

impl Decoder<Backend> {
    // Creates a new instance of the decoder using the dummy backend.
    pub fn new_dummy(config: DecoderConfig) -> Self {
        Self::new(Backend::new(), config)
    }
}
