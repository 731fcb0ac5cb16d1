// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;

use crate::decoders::h264::headers::RefPicMarking;
use crate::decoders::h264::headers::Slice;
use crate::decoders::h264::headers::SliceType;
use crate::decoders::h264::sequence::SequenceParams;
use crate::Resolution;

/// Stable identity of a picture stored in the DPB. Reference picture lists
/// refer to pictures through these, never through borrows.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PictureId(pub(crate) u64);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IsIdr {
    #[default]
    No,
    Yes {
        idr_pic_id: u16,
    },
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct PictureData {
    pub pic_order_cnt_type: u8,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub pic_order_cnt: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_lsb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,

    pub pic_num: i32,
    pub long_term_pic_num: i32,
    pub frame_num: i32,
    pub frame_num_offset: i32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: i32,

    pub coded_resolution: Resolution,

    pub type_: SliceType,
    pub nal_ref_idc: u8,
    pub is_idr: IsIdr,
    reference: Reference,
    pub needed_for_output: bool,

    // Does memory management op 5 needs to be executed after this
    // picture has finished decoding?
    pub has_mmco_5: bool,

    // Created by the decoding process for gaps in frame_num, or a picture
    // the backend failed to decode. Never output.
    pub nonexisting: bool,

    // Values from slice_hdr to be used during reference marking and
    // memory management after finishing this picture.
    pub ref_pic_marking: RefPicMarking,

    pub timestamp: u64,
}

impl PictureData {
    pub fn new_non_existing(frame_num: i32, timestamp: u64) -> Self {
        PictureData {
            frame_num,
            nonexisting: true,
            nal_ref_idc: 1,
            pic_num: frame_num,
            reference: Reference::ShortTerm,
            timestamp,
            ..Default::default()
        }
    }

    pub fn new_from_slice(slice: &Slice, seq: &SequenceParams, timestamp: u64) -> Self {
        let hdr = &slice.header;
        let nalu_hdr = &slice.nalu_header;

        let is_idr = if nalu_hdr.idr_pic_flag {
            IsIdr::Yes {
                idr_pic_id: hdr.idr_pic_id,
            }
        } else {
            IsIdr::No
        };

        let reference = if nalu_hdr.ref_idc != 0 {
            Reference::ShortTerm
        } else {
            Reference::None
        };

        let frame_num = i32::from(hdr.frame_num);

        let pic = PictureData {
            pic_order_cnt_type: seq.pic_order_cnt_type,
            pic_order_cnt_lsb: i32::from(hdr.pic_order_cnt_lsb),
            delta_pic_order_cnt_bottom: hdr.delta_pic_order_cnt_bottom,
            delta_pic_order_cnt0: hdr.delta_pic_order_cnt[0],
            delta_pic_order_cnt1: hdr.delta_pic_order_cnt[1],
            pic_num: frame_num,
            frame_num,
            coded_resolution: seq.coded_resolution,
            type_: hdr.slice_type,
            nal_ref_idc: nalu_hdr.ref_idc,
            is_idr,
            reference,
            needed_for_output: true,
            ref_pic_marking: hdr.dec_ref_pic_marking.clone(),
            timestamp,
            ..Default::default()
        };

        debug!("New picture: frame_num {}, timestamp {}", frame_num, timestamp);

        pic
    }

    /// Whether the current picture is a reference, either ShortTerm or LongTerm.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn is_idr(&self) -> bool {
        matches!(self.is_idr, IsIdr::Yes { .. })
    }

    pub fn reference(&self) -> Reference {
        self.reference
    }

    pub fn set_reference(&mut self, reference: Reference) {
        debug!(
            "Set reference of frame_num {} (POC {}) to {:?}",
            self.frame_num, self.pic_order_cnt, reference
        );

        self.reference = reference;
    }
}

impl std::fmt::Debug for PictureData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PictureData")
            .field("pic_order_cnt_type", &self.pic_order_cnt_type)
            .field("top_field_order_cnt", &self.top_field_order_cnt)
            .field("bottom_field_order_cnt", &self.bottom_field_order_cnt)
            .field("pic_order_cnt", &self.pic_order_cnt)
            .field("pic_order_cnt_msb", &self.pic_order_cnt_msb)
            .field("pic_order_cnt_lsb", &self.pic_order_cnt_lsb)
            .field("pic_num", &self.pic_num)
            .field("long_term_pic_num", &self.long_term_pic_num)
            .field("frame_num", &self.frame_num)
            .field("frame_num_offset", &self.frame_num_offset)
            .field("frame_num_wrap", &self.frame_num_wrap)
            .field("long_term_frame_idx", &self.long_term_frame_idx)
            .field("type_", &self.type_)
            .field("nal_ref_idc", &self.nal_ref_idc)
            .field("is_idr", &self.is_idr)
            .field("reference", &self.reference)
            .field("needed_for_output", &self.needed_for_output)
            .field("has_mmco_5", &self.has_mmco_5)
            .field("nonexisting", &self.nonexisting)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
