// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsed H.264 syntax structures.
//!
//! Bitstream parsing happens outside of this crate. These types carry the
//! syntax elements the decoder needs, already decoded from Exp-Golomb form.

use anyhow::anyhow;
use enumn::N;

use crate::Resolution;

/// Hard upper bound on the number of frames the DPB can hold. See A.3.1.
pub const DPB_MAX_SIZE: usize = 16;

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
}

impl NaluHeader {
    /// Decodes the one-byte header that starts every NAL unit.
    pub fn from_byte(byte: u8) -> anyhow::Result<Self> {
        if byte & 0x80 != 0 {
            return Err(anyhow!("forbidden_zero_bit is set"));
        }

        let type_ = NaluType::n(byte & 0x1f)
            .ok_or_else(|| anyhow!("Unknown NAL unit type {}", byte & 0x1f))?;

        Ok(Self {
            ref_idc: (byte >> 5) & 0x3,
            type_,
            idr_pic_flag: matches!(type_, NaluType::SliceIdr),
        })
    }
}

impl Default for NaluHeader {
    fn default() -> Self {
        Self {
            ref_idc: 0,
            type_: NaluType::Unknown,
            idr_pic_flag: false,
        }
    }
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
/// See table 7-6 of ITU-T H.264.
pub enum SliceType {
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl Default for SliceType {
    fn default() -> Self {
        Self::P
    }
}

impl SliceType {
    /// Maps a raw `slice_type` value, which may be offset by 5 to signal that
    /// every slice of the picture has the same type.
    pub fn from_raw(slice_type: u8) -> Option<Self> {
        Self::n(slice_type % 5)
    }

    /// Whether slices of this type predict from list 0 only.
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P | SliceType::Sp)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    /// Whether slices of this type use no inter prediction at all.
    pub fn is_intra(&self) -> bool {
        matches!(self, SliceType::I | SliceType::Si)
    }
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

impl Level {
    /// MaxDpbMbs for this level. See Table A-1.
    pub fn max_dpb_mbs(&self) -> u32 {
        match self {
            Level::L1 | Level::L1B => 396,
            Level::L1_1 => 900,
            Level::L1_2 | Level::L1_3 | Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 | Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 | Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 | Level::L5_2 => 184320,
            Level::L6 | Level::L6_1 | Level::L6_2 => 696320,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub bitstream_restriction_flag: bool,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

/// A H264 Sequence Parameter Set, reduced to the fields that drive decoding
/// order and buffer management.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,
    pub constraint_set3_flag: bool,
    pub level_idc: u8,

    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: Vec<i32>,

    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            seq_parameter_set_id: 0,
            profile_idc: 66,
            constraint_set3_flag: false,
            level_idc: Level::L3 as u8,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            delta_pic_order_always_zero_flag: false,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            num_ref_frames_in_pic_order_cnt_cycle: 0,
            offset_for_ref_frame: Vec::new(),
            max_num_ref_frames: 1,
            gaps_in_frame_num_value_allowed_flag: false,
            pic_width_in_mbs_minus1: 0,
            pic_height_in_map_units_minus1: 0,
            frame_mbs_only_flag: true,
            vui_parameters_present_flag: false,
            vui_parameters: Default::default(),
        }
    }
}

impl Sps {
    pub fn max_frame_num(&self) -> i32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    pub fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 + 1) * 16
    }

    pub fn height(&self) -> u32 {
        let map_units = self.pic_height_in_map_units_minus1 + 1;

        if self.frame_mbs_only_flag {
            map_units * 16
        } else {
            map_units * 32
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width(),
            height: self.height(),
        }
    }

    /// ExpectedDeltaPerPicOrderCntCycle, see (7-12).
    pub fn expected_delta_per_pic_order_cnt_cycle(&self) -> i64 {
        self.offset_for_ref_frame
            .iter()
            .take(usize::from(self.num_ref_frames_in_pic_order_cnt_cycle))
            .map(|&offset| i64::from(offset))
            .sum()
    }
}

/// A H264 Picture Parameter Set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /* if modification_of_pic_nums_idc == 0 || 1 */
    pub abs_diff_pic_num_minus1: u32,
    /* if modification_of_pic_nums_idc == 2 */
    pub long_term_pic_num: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    /// Specifies a control operation to be applied to affect the reference
    /// picture marking. The `memory_management_control_operation` syntax
    /// element is followed by data necessary for the operation specified by
    /// the value of `memory_management_control_operation`.
    pub memory_management_control_operation: u8,

    /// Used (with memory_management_control_operation equal to 3 or 1) to
    /// assign a long-term frame index to a short-term reference picture or to
    /// mark a short-term reference picture as "unused for reference".
    pub difference_of_pic_nums_minus1: u32,

    /// Used (with memory_management_control_operation equal to 2) to mark a
    /// long-term reference picture as "unused for reference".
    pub long_term_pic_num: u32,

    /// Used (with memory_management_control_operation equal to 3 or 6) to
    /// assign a long-term frame index to a picture.
    pub long_term_frame_idx: u32,

    /// Minus 1 specifies the maximum value of long-term frame index allowed
    /// for long-term reference frames (until receipt of another value of
    /// `max_long_term_frame_idx_plus1`).
    pub max_long_term_frame_idx_plus1: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// Specifies how the previously-decoded pictures in the decoded picture
    /// buffer are treated after decoding of an IDR picture.
    pub no_output_of_prior_pics_flag: bool,

    /// If unset, specifies that the MaxLongTermFrameIdx variable is set equal
    /// to "no long-term frame indices" and that the IDR picture is marked as
    /// "used for short-term reference". If set, specifies that the
    /// MaxLongTermFrameIdx variable is set equal to 0 and that the current IDR
    /// picture is marked "used for long-term reference" and is assigned
    /// LongTermFrameIdx equal to 0.
    pub long_term_reference_flag: bool,

    /// Selects the reference picture marking mode of the currently decoded
    /// picture. If unset, the sliding window mode is used, otherwise the
    /// adaptive mode and `inner` apply.
    pub adaptive_ref_pic_marking_mode_flag: bool,

    /// Memory management operations, in bitstream order.
    pub inner: Vec<RefPicMarkingInner>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,
    pub dec_ref_pic_marking: RefPicMarking,
}

/// A slice: the header plus the NAL header it was carried in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Slice {
    pub nalu_header: NaluHeader,
    pub header: SliceHeader,
}

/// A parsed NAL unit, as handed to the decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Nalu {
    Sps(Sps),
    Pps(Pps),
    Slice(Slice),
    AccessUnitDelimiter,
    EndOfSequence,
    EndOfStream,
    Other(NaluType),
}

impl Nalu {
    pub fn nalu_type(&self) -> NaluType {
        match self {
            Nalu::Sps(_) => NaluType::Sps,
            Nalu::Pps(_) => NaluType::Pps,
            Nalu::Slice(slice) => slice.nalu_header.type_,
            Nalu::AccessUnitDelimiter => NaluType::AuDelimiter,
            Nalu::EndOfSequence => NaluType::SeqEnd,
            Nalu::EndOfStream => NaluType::StreamEnd,
            Nalu::Other(type_) => *type_,
        }
    }
}
