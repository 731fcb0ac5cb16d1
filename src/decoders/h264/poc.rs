// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

use crate::decoders::h264::picture::PictureData;
use crate::decoders::h264::sequence::SequenceParams;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PocError {
    #[error("invalid pic_order_cnt_type {0}")]
    InvalidPicOrderCntType(u8),
    #[error("num_ref_frames_in_pic_order_cnt_cycle is 0 for a non-IDR picture")]
    EmptyPicOrderCntCycle,
    #[error("derived picture order count {0} is out of range")]
    OutOfRange(i64),
}

/// The derivations below run in 64 bits, header values being unbounded until
/// combined. Pictures carry their counts in 32 bits.
fn narrow(value: i64) -> Result<i32, PocError> {
    i32::try_from(value).map_err(|_| PocError::OutOfRange(value))
}

#[derive(Debug, Default)]
pub struct PrevReferencePicInfo {
    frame_num: i32,
    has_mmco_5: bool,
    top_field_order_cnt: i32,
    pic_order_cnt_msb: i32,
    pic_order_cnt_lsb: i32,
}

#[derive(Debug, Default)]
pub struct PrevPicInfo {
    frame_num: i32,
    frame_num_offset: i32,
    has_mmco_5: bool,
}

/// The state carried from one picture to the next by the POC and frame_num
/// derivations.
#[derive(Debug, Default)]
pub(crate) struct PocState {
    prev_ref_pic_info: PrevReferencePicInfo,
    prev_pic_info: PrevPicInfo,
}

impl PocState {
    /// PrevRefFrameNum, as used to detect gaps in frame_num.
    pub fn prev_ref_frame_num(&self) -> i32 {
        self.prev_ref_pic_info.frame_num
    }

    /// Called when an IDR picture starts, see 7.4.3.
    pub fn reset_prev_ref_frame_num(&mut self) {
        self.prev_ref_pic_info.frame_num = 0;
    }

    /// Computes the POC of `pic` following 8.2.1.
    pub fn compute_pic_order_count(
        &self,
        pic: &mut PictureData,
        seq: &SequenceParams,
    ) -> Result<(), PocError> {
        match pic.pic_order_cnt_type {
            0 => self.compute_type_0(pic, seq)?,
            1 => self.compute_type_1(pic, seq)?,
            2 => self.compute_type_2(pic, seq)?,
            other => return Err(PocError::InvalidPicOrderCntType(other)),
        }

        pic.pic_order_cnt = std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);

        Ok(())
    }

    // H.264 8.2.1.1
    fn compute_type_0(&self, pic: &mut PictureData, seq: &SequenceParams) -> Result<(), PocError> {
        let prev_pic_order_cnt_msb;
        let prev_pic_order_cnt_lsb;

        if pic.is_idr() {
            prev_pic_order_cnt_msb = 0;
            prev_pic_order_cnt_lsb = 0;
        } else if self.prev_ref_pic_info.has_mmco_5 {
            prev_pic_order_cnt_msb = 0;
            prev_pic_order_cnt_lsb = i64::from(self.prev_ref_pic_info.top_field_order_cnt);
        } else {
            prev_pic_order_cnt_msb = i64::from(self.prev_ref_pic_info.pic_order_cnt_msb);
            prev_pic_order_cnt_lsb = i64::from(self.prev_ref_pic_info.pic_order_cnt_lsb);
        }

        let max_pic_order_cnt_lsb = i64::from(seq.max_pic_order_cnt_lsb());
        let pic_order_cnt_lsb = i64::from(pic.pic_order_cnt_lsb);

        let pic_order_cnt_msb = if (pic_order_cnt_lsb < prev_pic_order_cnt_lsb)
            && (prev_pic_order_cnt_lsb - pic_order_cnt_lsb >= max_pic_order_cnt_lsb / 2)
        {
            prev_pic_order_cnt_msb + max_pic_order_cnt_lsb
        } else if (pic_order_cnt_lsb > prev_pic_order_cnt_lsb)
            && (pic_order_cnt_lsb - prev_pic_order_cnt_lsb > max_pic_order_cnt_lsb / 2)
        {
            prev_pic_order_cnt_msb - max_pic_order_cnt_lsb
        } else {
            prev_pic_order_cnt_msb
        };

        let top_field_order_cnt = pic_order_cnt_msb + pic_order_cnt_lsb;
        let bottom_field_order_cnt =
            top_field_order_cnt + i64::from(pic.delta_pic_order_cnt_bottom);

        pic.pic_order_cnt_msb = narrow(pic_order_cnt_msb)?;
        pic.top_field_order_cnt = narrow(top_field_order_cnt)?;
        pic.bottom_field_order_cnt = narrow(bottom_field_order_cnt)?;

        Ok(())
    }

    /// FrameNumOffset, shared by types 1 and 2. See (8-6) and (8-11).
    fn frame_num_offset(&self, pic: &PictureData, seq: &SequenceParams) -> Result<i32, PocError> {
        let prev_frame_num_offset = if self.prev_pic_info.has_mmco_5 {
            0
        } else {
            i64::from(self.prev_pic_info.frame_num_offset)
        };

        if pic.is_idr() {
            Ok(0)
        } else if self.prev_pic_info.frame_num > pic.frame_num {
            narrow(prev_frame_num_offset + i64::from(seq.max_frame_num))
        } else {
            narrow(prev_frame_num_offset)
        }
    }

    // H.264 8.2.1.2
    fn compute_type_1(&self, pic: &mut PictureData, seq: &SequenceParams) -> Result<(), PocError> {
        pic.frame_num_offset = self.frame_num_offset(pic, seq)?;

        let num_ref_frames_in_cycle = i64::from(seq.num_ref_frames_in_pic_order_cnt_cycle);

        let mut abs_frame_num = if num_ref_frames_in_cycle != 0 {
            i64::from(pic.frame_num_offset) + i64::from(pic.frame_num)
        } else {
            0
        };

        if pic.nal_ref_idc == 0 && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }

        let mut expected_pic_order_cnt: i64 = 0;

        if abs_frame_num > 0 {
            if num_ref_frames_in_cycle == 0 {
                return Err(PocError::EmptyPicOrderCntCycle);
            }

            let pic_order_cnt_cycle_cnt = (abs_frame_num - 1) / num_ref_frames_in_cycle;
            let frame_num_in_pic_order_cnt_cycle = (abs_frame_num - 1) % num_ref_frames_in_cycle;

            expected_pic_order_cnt = pic_order_cnt_cycle_cnt
                .saturating_mul(seq.expected_delta_per_pic_order_cnt_cycle)
                .saturating_add(
                    seq.offset_for_ref_frame
                        .iter()
                        .take(frame_num_in_pic_order_cnt_cycle as usize + 1)
                        .map(|&offset| i64::from(offset))
                        .sum::<i64>(),
                );
        }

        if pic.nal_ref_idc == 0 {
            expected_pic_order_cnt =
                expected_pic_order_cnt.saturating_add(i64::from(seq.offset_for_non_ref_pic));
        }

        let top_field_order_cnt =
            expected_pic_order_cnt.saturating_add(i64::from(pic.delta_pic_order_cnt0));
        let bottom_field_order_cnt = top_field_order_cnt
            .saturating_add(i64::from(seq.offset_for_top_to_bottom_field))
            .saturating_add(i64::from(pic.delta_pic_order_cnt1));

        pic.top_field_order_cnt = narrow(top_field_order_cnt)?;
        pic.bottom_field_order_cnt = narrow(bottom_field_order_cnt)?;

        Ok(())
    }

    // H.264 8.2.1.3
    fn compute_type_2(&self, pic: &mut PictureData, seq: &SequenceParams) -> Result<(), PocError> {
        pic.frame_num_offset = self.frame_num_offset(pic, seq)?;

        let abs_frame_num = i64::from(pic.frame_num_offset) + i64::from(pic.frame_num);

        let temp_pic_order_cnt = if pic.is_idr() {
            0
        } else if pic.nal_ref_idc == 0 {
            narrow(2 * abs_frame_num - 1)?
        } else {
            narrow(2 * abs_frame_num)?
        };

        pic.top_field_order_cnt = temp_pic_order_cnt;
        pic.bottom_field_order_cnt = temp_pic_order_cnt;

        Ok(())
    }

    /// Store some variables related to the previous reference picture. These
    /// will be used in the decoding of future pictures.
    pub fn fill_prev_ref_info(&mut self, pic: &PictureData) {
        let prev = &mut self.prev_ref_pic_info;

        prev.frame_num = pic.frame_num;
        prev.has_mmco_5 = pic.has_mmco_5;
        prev.top_field_order_cnt = pic.top_field_order_cnt;
        prev.pic_order_cnt_msb = pic.pic_order_cnt_msb;
        prev.pic_order_cnt_lsb = pic.pic_order_cnt_lsb;
    }

    /// Bookkeeping for a frame inferred from a gap in frame_num. Such a frame
    /// carries no POC of its own, so only the frame_num derivations see it.
    pub fn fill_gap_frame_info(&mut self, pic: &PictureData) {
        self.prev_ref_pic_info.frame_num = pic.frame_num;
        self.fill_prev_info(pic);
    }

    /// Store some variables related to the previous picture. These will be used
    /// in the decoding of future pictures.
    pub fn fill_prev_info(&mut self, pic: &PictureData) {
        let prev = &mut self.prev_pic_info;

        prev.frame_num = pic.frame_num;
        prev.has_mmco_5 = pic.has_mmco_5;
        prev.frame_num_offset = pic.frame_num_offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::h264::headers::Sps;
    use crate::decoders::h264::picture::IsIdr;
    use crate::decoders::Compliance;

    fn seq(pic_order_cnt_type: u8) -> SequenceParams {
        let sps = Sps {
            pic_order_cnt_type,
            // MaxFrameNum = 16, MaxPicOrderCntLsb = 16.
            log2_max_frame_num_minus4: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            num_ref_frames_in_pic_order_cnt_cycle: 2,
            offset_for_ref_frame: vec![2, 4],
            offset_for_non_ref_pic: -1,
            offset_for_top_to_bottom_field: 1,
            ..Default::default()
        };

        SequenceParams::from_sps(&sps, Compliance::Normal).unwrap()
    }

    fn pic(seq: &SequenceParams, frame_num: i32, nal_ref_idc: u8, idr: bool) -> PictureData {
        let mut pic = PictureData::default();
        pic.pic_order_cnt_type = seq.pic_order_cnt_type;
        pic.frame_num = frame_num;
        pic.nal_ref_idc = nal_ref_idc;
        if idr {
            pic.is_idr = IsIdr::Yes { idr_pic_id: 0 };
        }
        pic
    }

    /// Runs the POC derivation and the bookkeeping the decoder does after
    /// finishing a picture.
    fn decode(state: &mut PocState, seq: &SequenceParams, mut pic: PictureData) -> PictureData {
        state.compute_pic_order_count(&mut pic, seq).unwrap();

        if pic.nal_ref_idc != 0 {
            state.fill_prev_ref_info(&pic);
        }
        state.fill_prev_info(&pic);

        pic
    }

    #[test]
    fn type_0_lsb_wrap() {
        let seq = seq(0);
        let mut state = PocState::default();

        let mut idr = pic(&seq, 0, 1, true);
        idr.pic_order_cnt_lsb = 0;
        assert_eq!(decode(&mut state, &seq, idr).pic_order_cnt, 0);

        let mut p = pic(&seq, 1, 1, false);
        p.pic_order_cnt_lsb = 14;
        // 14 - 0 > 16 / 2: the lsb went backwards past a wrap.
        assert_eq!(decode(&mut state, &seq, p).pic_order_cnt, -2);

        let mut p = pic(&seq, 2, 1, false);
        p.pic_order_cnt_lsb = 2;
        // 14 - 2 >= 8: wrapped forward.
        let p = decode(&mut state, &seq, p);
        assert_eq!(p.pic_order_cnt_msb, 0);
        assert_eq!(p.pic_order_cnt, 2);

        let mut p = pic(&seq, 3, 1, false);
        p.pic_order_cnt_lsb = 8;
        p.delta_pic_order_cnt_bottom = -3;
        let p = decode(&mut state, &seq, p);
        assert_eq!(p.top_field_order_cnt, 8);
        assert_eq!(p.bottom_field_order_cnt, 5);
        assert_eq!(p.pic_order_cnt, 5);

        let mut p = pic(&seq, 4, 1, false);
        p.pic_order_cnt_lsb = 14;
        assert_eq!(decode(&mut state, &seq, p).pic_order_cnt, 14);

        let mut p = pic(&seq, 5, 1, false);
        p.pic_order_cnt_lsb = 2;
        // 14 - 2 >= 8: msb moves up by MaxPicOrderCntLsb.
        assert_eq!(decode(&mut state, &seq, p).pic_order_cnt, 18);
    }

    #[test]
    fn type_0_after_mmco_5() {
        let seq = seq(0);
        let mut state = PocState::default();

        let mut idr = pic(&seq, 0, 1, true);
        idr.pic_order_cnt_lsb = 0;
        decode(&mut state, &seq, idr);

        // A picture with MMCO 5 has its POC rebased to 0 once marked.
        let mut p = pic(&seq, 1, 1, false);
        p.pic_order_cnt_lsb = 6;
        let mut p = decode(&mut state, &seq, p);
        p.has_mmco_5 = true;
        p.top_field_order_cnt -= p.pic_order_cnt;
        p.bottom_field_order_cnt -= p.pic_order_cnt;
        p.pic_order_cnt = 0;
        state.fill_prev_ref_info(&p);

        let mut next = pic(&seq, 1, 1, false);
        next.pic_order_cnt_lsb = 2;
        assert_eq!(decode(&mut state, &seq, next).pic_order_cnt, 2);
    }

    #[test]
    fn type_1_cycle() {
        let seq = seq(1);
        let mut state = PocState::default();

        let idr = decode(&mut state, &seq, pic(&seq, 0, 1, true));
        assert_eq!(idr.pic_order_cnt, 0);

        // abs_frame_num 1: one full offset.
        let p = decode(&mut state, &seq, pic(&seq, 1, 1, false));
        assert_eq!(p.top_field_order_cnt, 2);
        assert_eq!(p.bottom_field_order_cnt, 3);
        assert_eq!(p.pic_order_cnt, 2);

        // abs_frame_num 2: offsets 2 + 4.
        let p = decode(&mut state, &seq, pic(&seq, 2, 1, false));
        assert_eq!(p.pic_order_cnt, 6);

        // abs_frame_num 3: one cycle (6) plus the first offset (2).
        let p = decode(&mut state, &seq, pic(&seq, 3, 1, false));
        assert_eq!(p.pic_order_cnt, 8);

        // Non-reference: abs_frame_num 3 and offset_for_non_ref_pic.
        let b = decode(&mut state, &seq, pic(&seq, 4, 0, false));
        assert_eq!(b.pic_order_cnt, 7);
    }

    #[test]
    fn type_1_without_cycle() {
        let mut seq = seq(1);
        seq.num_ref_frames_in_pic_order_cnt_cycle = 0;
        let mut state = PocState::default();

        // With an empty cycle abs_frame_num is 0 and POC only depends on the
        // deltas.
        let mut p = pic(&seq, 3, 1, false);
        p.delta_pic_order_cnt0 = 4;
        state.compute_pic_order_count(&mut p, &seq).unwrap();
        assert_eq!(p.pic_order_cnt, 4);
    }

    #[test]
    fn type_2_frame_num_wrap() {
        let seq = seq(2);
        let mut state = PocState::default();

        assert_eq!(decode(&mut state, &seq, pic(&seq, 0, 1, true)).pic_order_cnt, 0);
        assert_eq!(decode(&mut state, &seq, pic(&seq, 15, 1, false)).pic_order_cnt, 30);

        // frame_num wrapped: FrameNumOffset grows by MaxFrameNum.
        let p = decode(&mut state, &seq, pic(&seq, 0, 1, false));
        assert_eq!(p.frame_num_offset, 16);
        assert_eq!(p.pic_order_cnt, 32);

        let b = decode(&mut state, &seq, pic(&seq, 1, 0, false));
        assert_eq!(b.pic_order_cnt, 33);
    }

    #[test]
    fn type_2_after_mmco_5() {
        let seq = seq(2);
        let mut state = PocState::default();

        decode(&mut state, &seq, pic(&seq, 0, 1, true));
        let mut p = pic(&seq, 5, 1, false);
        state.compute_pic_order_count(&mut p, &seq).unwrap();
        assert_eq!(p.pic_order_cnt, 10);

        p.has_mmco_5 = true;
        p.frame_num = 0;
        state.fill_prev_ref_info(&p);
        state.fill_prev_info(&p);

        let next = decode(&mut state, &seq, pic(&seq, 1, 1, false));
        assert_eq!(next.frame_num_offset, 0);
        assert_eq!(next.pic_order_cnt, 2);
    }

    #[test]
    fn gap_frames_keep_type_0_reference() {
        let seq = seq(0);
        let mut state = PocState::default();

        let mut idr = pic(&seq, 0, 1, true);
        idr.pic_order_cnt_lsb = 6;
        decode(&mut state, &seq, idr);

        let mut gap = PictureData::new_non_existing(1, 0);
        state.compute_pic_order_count(&mut gap, &seq).unwrap();
        state.fill_gap_frame_info(&gap);
        assert_eq!(state.prev_ref_frame_num(), 1);

        // Still relative to the IDR's lsb of 6, so no wrap is detected.
        let mut p = pic(&seq, 2, 1, false);
        p.pic_order_cnt_lsb = 14;
        assert_eq!(decode(&mut state, &seq, p).pic_order_cnt, 14);
    }

    #[test]
    fn invalid_type() {
        let seq = seq(0);
        let mut state = PocState::default();
        let mut p = pic(&seq, 0, 1, true);
        p.pic_order_cnt_type = 3;

        assert_eq!(
            state.compute_pic_order_count(&mut p, &seq),
            Err(PocError::InvalidPicOrderCntType(3))
        );
    }

    #[test]
    fn out_of_range_counts() {
        let seq0 = seq(0);
        let state = PocState::default();

        let mut idr = pic(&seq0, 0, 1, true);
        idr.pic_order_cnt_lsb = 1;
        idr.delta_pic_order_cnt_bottom = i32::MAX;
        assert_eq!(
            state.compute_pic_order_count(&mut idr, &seq0),
            Err(PocError::OutOfRange(1 << 31))
        );

        let mut seq1 = seq(1);
        seq1.offset_for_ref_frame = vec![i32::MAX, i32::MAX];
        seq1.expected_delta_per_pic_order_cnt_cycle = 2 * i64::from(i32::MAX);

        // abs_frame_num 2: both offsets.
        let mut p = pic(&seq1, 2, 1, false);
        assert_eq!(
            state.compute_pic_order_count(&mut p, &seq1),
            Err(PocError::OutOfRange(2 * i64::from(i32::MAX)))
        );

        let mut p = pic(&seq1, 1, 1, false);
        p.delta_pic_order_cnt0 = i32::MIN;
        state.compute_pic_order_count(&mut p, &seq1).unwrap();
        assert_eq!(p.top_field_order_cnt, -1);
    }

    #[test]
    fn prev_ref_frame_num_tracking() {
        let seq = seq(2);
        let mut state = PocState::default();

        decode(&mut state, &seq, pic(&seq, 3, 1, false));
        assert_eq!(state.prev_ref_frame_num(), 3);

        // Non-reference pictures do not move it.
        decode(&mut state, &seq, pic(&seq, 4, 0, false));
        assert_eq!(state.prev_ref_frame_num(), 3);

        state.reset_prev_ref_frame_num();
        assert_eq!(state.prev_ref_frame_num(), 0);
    }
}
