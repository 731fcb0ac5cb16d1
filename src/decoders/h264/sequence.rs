// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::warn;
use thiserror::Error;

use crate::decoders::h264::headers::Level;
use crate::decoders::h264::headers::Sps;
use crate::decoders::h264::headers::DPB_MAX_SIZE;
use crate::decoders::Compliance;
use crate::Resolution;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SpsError {
    #[error("field coded streams (frame_mbs_only_flag = 0) are not supported")]
    FieldCodingUnsupported,
    #[error("unknown level_idc {0}")]
    UnknownLevel(u8),
    #[error("invalid picture size {0}x{1}")]
    InvalidSize(u32, u32),
    #[error("invalid log2_max_frame_num_minus4 {0}")]
    InvalidMaxFrameNum(u8),
    #[error("invalid log2_max_pic_order_cnt_lsb_minus4 {0}")]
    InvalidMaxPicOrderCntLsb(u8),
    #[error("num_ref_frames_in_pic_order_cnt_cycle is {expected} but {actual} offsets were given")]
    PicOrderCntCycleMismatch { expected: u8, actual: usize },
}

/// Values derived from the active SPS that stay fixed until the next
/// sequence change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceParams {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,
    pub coded_resolution: Resolution,

    pub max_frame_num: i32,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb: u8,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: Vec<i32>,
    pub expected_delta_per_pic_order_cnt_cycle: i64,

    pub max_num_ref_frames: usize,
    pub gaps_in_frame_num_value_allowed: bool,

    /// Number of frames the DPB holds for this sequence.
    pub max_dpb_size: usize,
    /// Maximum number of frames that may precede any frame in decoding order
    /// and follow it in output order.
    pub max_num_reorder_frames: usize,
}

impl SequenceParams {
    pub fn from_sps(sps: &Sps, compliance: Compliance) -> Result<Self, SpsError> {
        if !sps.frame_mbs_only_flag {
            return Err(SpsError::FieldCodingUnsupported);
        }

        if sps.log2_max_frame_num_minus4 > 12 {
            return Err(SpsError::InvalidMaxFrameNum(sps.log2_max_frame_num_minus4));
        }

        if sps.pic_order_cnt_type == 0 && sps.log2_max_pic_order_cnt_lsb_minus4 > 12 {
            return Err(SpsError::InvalidMaxPicOrderCntLsb(
                sps.log2_max_pic_order_cnt_lsb_minus4,
            ));
        }

        if sps.pic_order_cnt_type == 1
            && sps.offset_for_ref_frame.len()
                < usize::from(sps.num_ref_frames_in_pic_order_cnt_cycle)
        {
            return Err(SpsError::PicOrderCntCycleMismatch {
                expected: sps.num_ref_frames_in_pic_order_cnt_cycle,
                actual: sps.offset_for_ref_frame.len(),
            });
        }

        let max_dpb_size = Self::max_dpb_size(sps)?;
        let max_num_reorder_frames = Self::max_num_reorder_frames(sps, max_dpb_size, compliance);

        Ok(Self {
            seq_parameter_set_id: sps.seq_parameter_set_id,
            profile_idc: sps.profile_idc,
            coded_resolution: sps.resolution(),
            max_frame_num: sps.max_frame_num(),
            pic_order_cnt_type: sps.pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb: sps.log2_max_pic_order_cnt_lsb_minus4 + 4,
            offset_for_non_ref_pic: sps.offset_for_non_ref_pic,
            offset_for_top_to_bottom_field: sps.offset_for_top_to_bottom_field,
            num_ref_frames_in_pic_order_cnt_cycle: sps.num_ref_frames_in_pic_order_cnt_cycle,
            offset_for_ref_frame: sps.offset_for_ref_frame.clone(),
            expected_delta_per_pic_order_cnt_cycle: sps.expected_delta_per_pic_order_cnt_cycle(),
            max_num_ref_frames: sps.max_num_ref_frames as usize,
            gaps_in_frame_num_value_allowed: sps.gaps_in_frame_num_value_allowed_flag,
            max_dpb_size,
            max_num_reorder_frames,
        })
    }

    /// MaxPicOrderCntLsb, see (7-11).
    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << self.log2_max_pic_order_cnt_lsb
    }

    /// Whether switching from `self` to `other` requires the DPB to be
    /// drained and the backend to be told about a new sequence.
    pub fn needs_new_sequence(&self, other: &SequenceParams) -> bool {
        self.coded_resolution != other.coded_resolution
            || self.max_dpb_size != other.max_dpb_size
            || self.max_num_reorder_frames != other.max_num_reorder_frames
    }

    fn max_dpb_size(sps: &Sps) -> Result<usize, SpsError> {
        let mut level = Level::n(sps.level_idc).ok_or(SpsError::UnknownLevel(sps.level_idc))?;

        // A.3.1 and A.3.2: Level 1b for Baseline, Constrained Baseline and Main
        // profile if level_idc == 11 and constraint_set3_flag == 1
        if matches!(level, Level::L1_1)
            && (sps.profile_idc == 66 || sps.profile_idc == 77)
            && sps.constraint_set3_flag
        {
            level = Level::L1B;
        }

        let resolution = sps.resolution();
        let num_mbs = resolution.num_macroblocks();
        if num_mbs == 0 {
            return Err(SpsError::InvalidSize(resolution.width, resolution.height));
        }

        let mut max_dpb_frames =
            std::cmp::min(level.max_dpb_mbs() / num_mbs, DPB_MAX_SIZE as u32) as usize;

        if sps.vui_parameters_present_flag && sps.vui_parameters.bitstream_restriction_flag {
            max_dpb_frames =
                std::cmp::max(1, sps.vui_parameters.max_dec_frame_buffering as usize);
        }

        let max_dpb_size = std::cmp::max(max_dpb_frames, sps.max_num_ref_frames as usize);

        if max_dpb_size > DPB_MAX_SIZE {
            warn!(
                "Invalid DPB size {}, clamping to {}",
                max_dpb_size, DPB_MAX_SIZE
            );
            return Ok(DPB_MAX_SIZE);
        }

        Ok(max_dpb_size)
    }

    fn max_num_reorder_frames(sps: &Sps, max_dpb_size: usize, compliance: Compliance) -> usize {
        let vui = &sps.vui_parameters;

        if sps.vui_parameters_present_flag && vui.bitstream_restriction_flag {
            let max_num_reorder_frames = vui.max_num_reorder_frames as usize;

            if max_num_reorder_frames > max_dpb_size {
                warn!(
                    "max_num_reorder_frames {} exceeds the DPB size {}, assuming 0",
                    max_num_reorder_frames, max_dpb_size
                );
                return 0;
            }

            return max_num_reorder_frames;
        }

        // A.3.4 and A.3.5: intra profiles with constraint_set3_flag cannot
        // reorder.
        if matches!(sps.profile_idc, 44 | 86 | 100 | 110 | 122 | 244) && sps.constraint_set3_flag
        {
            return 0;
        }

        // Baseline and constrained baseline have no B slices.
        if compliance != Compliance::Strict && matches!(sps.profile_idc, 66 | 83) {
            return 0;
        }

        max_dpb_size
    }
}
