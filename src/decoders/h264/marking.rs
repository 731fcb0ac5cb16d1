// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded reference picture marking, see 8.2.5.

use log::debug;
use log::trace;
use thiserror::Error;

use crate::decoders::h264::dpb::Dpb;
use crate::decoders::h264::headers::RefPicMarkingInner;
use crate::decoders::h264::picture::PictureData;
use crate::decoders::h264::picture::Reference;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MmcoError {
    #[error("could not find a ShortTerm picture with pic_num {0} in the DPB")]
    NoShortTermPic(i32),
    #[error("could not find a LongTerm picture with long_term_pic_num {0} in the DPB")]
    NoLongTermPic(i32),
    #[error("a non-existing picture cannot become a long term reference")]
    ExpectedExisting,
    #[error("could not find a ShortTerm picture to unmark in the sliding window")]
    NoShortTermToUnmark,
    #[error("unknown memory_management_control_operation {0}")]
    UnknownOperation(u8),
    #[error("difference_of_pic_nums_minus1 {0} is out of range")]
    InvalidDifferenceOfPicNums(u32),
    #[error("invalid max_long_term_frame_idx_plus1 {0}")]
    InvalidMaxLongTermFrameIdx(i32),
}

/// Value of `long_term_frame_idx` or `long_term_pic_num` in a marking, which
/// the bitstream limits far below `i32::MAX`.
fn as_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// picNumX of MMCO 1 and 3, see (8-39).
fn pic_num_x(pic: &PictureData, marking: &RefPicMarkingInner) -> Result<i32, MmcoError> {
    let difference_of_pic_nums_minus1 = marking.difference_of_pic_nums_minus1;

    i32::try_from(difference_of_pic_nums_minus1)
        .ok()
        .and_then(|diff| pic.pic_num.checked_sub(diff))
        .and_then(|pic_num_x| pic_num_x.checked_sub(1))
        .ok_or(MmcoError::InvalidDifferenceOfPicNums(difference_of_pic_nums_minus1))
}

impl Dpb {
    /// Marks `pic` and the pictures in the DPB once `pic` has been decoded.
    /// `max_long_term_frame_idx` is updated by IDR pictures and by MMCO 4 and
    /// 5.
    pub(crate) fn reference_pic_marking(
        &mut self,
        pic: &mut PictureData,
        max_long_term_frame_idx: &mut i32,
        max_num_ref_frames: usize,
    ) -> Result<(), MmcoError> {
        /* 8.2.5.1 */
        if pic.is_idr() {
            self.mark_all_as_unused_for_ref();

            if pic.ref_pic_marking.long_term_reference_flag {
                pic.set_reference(Reference::LongTerm);
                pic.long_term_frame_idx = 0;
                pic.long_term_pic_num = 0;
                *max_long_term_frame_idx = 0;
            } else {
                pic.set_reference(Reference::ShortTerm);
                *max_long_term_frame_idx = -1;
            }

            return Ok(());
        }

        if pic.ref_pic_marking.adaptive_ref_pic_marking_mode_flag {
            self.handle_memory_management_ops(pic, max_long_term_frame_idx)
        } else {
            self.sliding_window_marking(max_num_ref_frames)
        }
    }

    /// 8.2.5.3: unmark the oldest short term references until there is room
    /// for the current picture.
    pub(crate) fn sliding_window_marking(
        &mut self,
        max_num_ref_frames: usize,
    ) -> Result<(), MmcoError> {
        let mut num_ref_pics = self.num_ref_frames();
        let max_num_ref_frames = std::cmp::max(1, max_num_ref_frames);

        while num_ref_pics >= max_num_ref_frames {
            let to_unmark = self
                .find_short_term_lowest_frame_num_wrap()
                .ok_or(MmcoError::NoShortTermToUnmark)?;

            if let Some(pic) = self.get_mut(to_unmark) {
                debug!("Sliding window: unmarking frame_num {}", pic.frame_num);
                pic.set_reference(Reference::None);
            }

            num_ref_pics -= 1;
        }

        Ok(())
    }

    fn handle_memory_management_ops(
        &mut self,
        pic: &mut PictureData,
        max_long_term_frame_idx: &mut i32,
    ) -> Result<(), MmcoError> {
        let markings = pic.ref_pic_marking.inner.clone();

        for marking in &markings {
            match marking.memory_management_control_operation {
                0 => break,
                1 => self.mmco_op_1(pic, marking)?,
                2 => self.mmco_op_2(marking)?,
                3 => self.mmco_op_3(pic, marking)?,
                4 => self.mmco_op_4(marking, max_long_term_frame_idx)?,
                5 => self.mmco_op_5(pic, max_long_term_frame_idx),
                6 => self.mmco_op_6(pic, marking),
                other => return Err(MmcoError::UnknownOperation(other)),
            }
        }

        Ok(())
    }

    fn mmco_op_1(
        &mut self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        let pic_num_x = pic_num_x(pic, marking)?;

        debug!("MMCO op 1 for pic_num_x {}", pic_num_x);
        trace!("Dpb state before MMCO=1: {:#?}", self);

        let to_mark = self
            .find_short_term_with_pic_num(pic_num_x)
            .ok_or(MmcoError::NoShortTermPic(pic_num_x))?;

        if let Some(to_mark) = self.get_mut(to_mark) {
            to_mark.set_reference(Reference::None);
        }

        Ok(())
    }

    fn mmco_op_2(&mut self, marking: &RefPicMarkingInner) -> Result<(), MmcoError> {
        let long_term_pic_num = as_i32(marking.long_term_pic_num);

        debug!("MMCO op 2 for long_term_pic_num {}", long_term_pic_num);
        trace!("Dpb state before MMCO=2: {:#?}", self);

        let to_mark = self
            .find_long_term_with_long_term_pic_num(long_term_pic_num)
            .ok_or(MmcoError::NoLongTermPic(long_term_pic_num))?;

        if let Some(to_mark) = self.get_mut(to_mark) {
            to_mark.set_reference(Reference::None);
        }

        Ok(())
    }

    fn mmco_op_3(
        &mut self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        let pic_num_x = pic_num_x(pic, marking)?;
        let long_term_frame_idx = as_i32(marking.long_term_frame_idx);

        debug!(
            "MMCO op 3 for pic_num_x {}, long_term_frame_idx {}",
            pic_num_x, long_term_frame_idx
        );
        trace!("Dpb state before MMCO=3: {:#?}", self);

        let to_mark_as_long = self
            .find_short_term_with_pic_num(pic_num_x)
            .ok_or(MmcoError::NoShortTermPic(pic_num_x))?;

        if self.get(to_mark_as_long).map_or(true, |p| p.nonexisting) {
            return Err(MmcoError::ExpectedExisting);
        }

        // When LongTermFrameIdx equal to long_term_frame_idx is already
        // assigned to a long-term reference frame, that frame is marked as
        // "unused for reference".
        self.unmark_long_term_frame_idx(long_term_frame_idx);

        if let Some(to_mark) = self.get_mut(to_mark_as_long) {
            to_mark.set_reference(Reference::LongTerm);
            to_mark.long_term_frame_idx = long_term_frame_idx;
            to_mark.long_term_pic_num = long_term_frame_idx;
        }

        Ok(())
    }

    fn mmco_op_4(
        &mut self,
        marking: &RefPicMarkingInner,
        max_long_term_frame_idx: &mut i32,
    ) -> Result<(), MmcoError> {
        if marking.max_long_term_frame_idx_plus1 < 0 {
            return Err(MmcoError::InvalidMaxLongTermFrameIdx(
                marking.max_long_term_frame_idx_plus1,
            ));
        }

        *max_long_term_frame_idx = marking.max_long_term_frame_idx_plus1 - 1;

        debug!(
            "MMCO op 4, max_long_term_frame_idx: {}",
            max_long_term_frame_idx
        );
        trace!("Dpb state before MMCO=4: {:#?}", self);

        let max_long_term_frame_idx = *max_long_term_frame_idx;
        for entry_id in self.long_term_refs() {
            if let Some(dpb_pic) = self.get_mut(entry_id) {
                if dpb_pic.long_term_frame_idx > max_long_term_frame_idx {
                    dpb_pic.set_reference(Reference::None);
                }
            }
        }

        Ok(())
    }

    fn mmco_op_5(&mut self, pic: &mut PictureData, max_long_term_frame_idx: &mut i32) {
        debug!("MMCO op 5, marking all pictures in the DPB as unused for reference");
        trace!("Dpb state before MMCO=5: {:#?}", self);

        self.mark_all_as_unused_for_ref();

        pic.has_mmco_5 = true;

        // After the decoding of the current picture and the processing of the
        // memory management control operations, the picture shall be inferred
        // to have had frame_num equal to 0.
        pic.frame_num = 0;

        *max_long_term_frame_idx = -1;

        // tempPicOrderCnt is set equal to PicOrderCnt(CurrPic) and subtracted
        // from both field order counts, see 8.2.1.
        pic.top_field_order_cnt = pic.top_field_order_cnt.saturating_sub(pic.pic_order_cnt);
        pic.bottom_field_order_cnt = pic.bottom_field_order_cnt.saturating_sub(pic.pic_order_cnt);
        pic.pic_order_cnt = std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);
    }

    fn mmco_op_6(&mut self, pic: &mut PictureData, marking: &RefPicMarkingInner) {
        let long_term_frame_idx = as_i32(marking.long_term_frame_idx);

        debug!("MMCO op 6, long_term_frame_idx: {}", long_term_frame_idx);
        trace!("Dpb state before MMCO=6: {:#?}", self);

        self.unmark_long_term_frame_idx(long_term_frame_idx);

        pic.set_reference(Reference::LongTerm);
        pic.long_term_frame_idx = long_term_frame_idx;
        pic.long_term_pic_num = long_term_frame_idx;
    }

    fn unmark_long_term_frame_idx(&mut self, long_term_frame_idx: i32) {
        for id in self.long_term_refs() {
            if let Some(dpb_pic) = self.get_mut(id) {
                if dpb_pic.long_term_frame_idx == long_term_frame_idx {
                    dpb_pic.set_reference(Reference::None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::h264::dpb::tests::frame;
    use crate::decoders::h264::headers::RefPicMarking;
    use crate::decoders::h264::picture::IsIdr;
    use crate::decoders::h264::picture::PictureId;

    fn dpb_with_short_terms(frame_nums: &[i32]) -> (Dpb, Vec<PictureId>) {
        let mut dpb = Dpb::default();
        dpb.set_max_num_pics(16);

        let ids = frame_nums
            .iter()
            .map(|&n| dpb.store_picture(frame(n, 2 * n, Reference::ShortTerm)).unwrap())
            .collect();

        (dpb, ids)
    }

    fn current(frame_num: i32, ops: Vec<RefPicMarkingInner>) -> PictureData {
        let mut pic = frame(frame_num, 2 * frame_num, Reference::ShortTerm);
        pic.ref_pic_marking = RefPicMarking {
            adaptive_ref_pic_marking_mode_flag: !ops.is_empty(),
            inner: ops,
            ..Default::default()
        };
        pic
    }

    fn op(memory_management_control_operation: u8) -> RefPicMarkingInner {
        RefPicMarkingInner {
            memory_management_control_operation,
            ..Default::default()
        }
    }

    #[test]
    fn idr_marking() {
        let (mut dpb, ids) = dpb_with_short_terms(&[0, 1]);
        let mut max_long_term_frame_idx = 3;

        let mut idr = current(0, vec![]);
        idr.is_idr = IsIdr::Yes { idr_pic_id: 1 };
        dpb.reference_pic_marking(&mut idr, &mut max_long_term_frame_idx, 4)
            .unwrap();

        assert_eq!(idr.reference(), Reference::ShortTerm);
        assert_eq!(max_long_term_frame_idx, -1);
        assert!(ids.iter().all(|&id| !dpb.get(id).unwrap().is_ref()));

        let mut idr = current(0, vec![]);
        idr.is_idr = IsIdr::Yes { idr_pic_id: 2 };
        idr.ref_pic_marking.long_term_reference_flag = true;
        dpb.reference_pic_marking(&mut idr, &mut max_long_term_frame_idx, 4)
            .unwrap();

        assert_eq!(idr.reference(), Reference::LongTerm);
        assert_eq!(idr.long_term_frame_idx, 0);
        assert_eq!(max_long_term_frame_idx, 0);
    }

    #[test]
    fn sliding_window() {
        let (mut dpb, ids) = dpb_with_short_terms(&[5, 6, 7]);
        dpb.update_pic_nums(8, 16);

        let mut pic = current(8, vec![]);
        let mut max_long_term_frame_idx = -1;
        dpb.reference_pic_marking(&mut pic, &mut max_long_term_frame_idx, 3)
            .unwrap();

        assert!(!dpb.get(ids[0]).unwrap().is_ref());
        assert!(dpb.get(ids[1]).unwrap().is_ref());
        assert!(dpb.get(ids[2]).unwrap().is_ref());
        assert_eq!(dpb.num_ref_frames(), 2);

        // Below the limit: nothing happens.
        dpb.sliding_window_marking(3).unwrap();
        assert_eq!(dpb.num_ref_frames(), 2);
    }

    #[test]
    fn sliding_window_uses_frame_num_wrap() {
        // frame_num 15 is older than frame_num 0 after a wrap.
        let (mut dpb, ids) = dpb_with_short_terms(&[15, 0]);
        dpb.update_pic_nums(1, 16);

        dpb.sliding_window_marking(2).unwrap();

        assert!(!dpb.get(ids[0]).unwrap().is_ref());
        assert!(dpb.get(ids[1]).unwrap().is_ref());
    }

    #[test]
    fn sliding_window_zero_ref_frames() {
        let (mut dpb, _) = dpb_with_short_terms(&[0]);

        // max_num_ref_frames of 0 still allows one reference.
        dpb.sliding_window_marking(0).unwrap();
        assert_eq!(dpb.num_ref_frames(), 0);
    }

    #[test]
    fn sliding_window_only_long_terms() {
        let mut dpb = Dpb::default();
        dpb.set_max_num_pics(4);
        dpb.store_picture(frame(0, 0, Reference::LongTerm)).unwrap();

        assert_eq!(
            dpb.sliding_window_marking(1),
            Err(MmcoError::NoShortTermToUnmark)
        );
    }

    #[test]
    fn mmco_1_and_2() {
        let (mut dpb, ids) = dpb_with_short_terms(&[1, 2, 3]);
        dpb.update_pic_nums(4, 16);

        let mut lt = frame(0, 0, Reference::LongTerm);
        lt.long_term_frame_idx = 2;
        let lt = dpb.store_picture(lt).unwrap();
        dpb.update_pic_nums(4, 16);

        let mut pic = current(
            4,
            vec![
                // pic_num_x = 4 - (1 + 1) = 2
                RefPicMarkingInner {
                    difference_of_pic_nums_minus1: 1,
                    ..op(1)
                },
                RefPicMarkingInner {
                    long_term_pic_num: 2,
                    ..op(2)
                },
                op(0),
                // Never reached.
                op(5),
            ],
        );

        let mut max_long_term_frame_idx = 2;
        dpb.reference_pic_marking(&mut pic, &mut max_long_term_frame_idx, 4)
            .unwrap();

        assert!(dpb.get(ids[0]).unwrap().is_ref());
        assert!(!dpb.get(ids[1]).unwrap().is_ref());
        assert!(dpb.get(ids[2]).unwrap().is_ref());
        assert!(!dpb.get(lt).unwrap().is_ref());
        assert!(!pic.has_mmco_5);
    }

    #[test]
    fn mmco_missing_pictures() {
        let (mut dpb, _) = dpb_with_short_terms(&[1]);
        dpb.update_pic_nums(4, 16);
        let mut max_long_term_frame_idx = -1;

        let mut pic = current(4, vec![op(1)]);
        assert_eq!(
            dpb.reference_pic_marking(&mut pic, &mut max_long_term_frame_idx, 4),
            Err(MmcoError::NoShortTermPic(3))
        );

        let mut pic = current(
            4,
            vec![RefPicMarkingInner {
                long_term_pic_num: 7,
                ..op(2)
            }],
        );
        assert_eq!(
            dpb.reference_pic_marking(&mut pic, &mut max_long_term_frame_idx, 4),
            Err(MmcoError::NoLongTermPic(7))
        );

        let mut pic = current(4, vec![op(7)]);
        assert_eq!(
            dpb.reference_pic_marking(&mut pic, &mut max_long_term_frame_idx, 4),
            Err(MmcoError::UnknownOperation(7))
        );
    }

    #[test]
    fn mmco_out_of_range_values() {
        let (mut dpb, ids) = dpb_with_short_terms(&[1]);
        dpb.update_pic_nums(4, 16);
        let mut max_long_term_frame_idx = -1;

        for mmco in [1, 3] {
            for difference_of_pic_nums_minus1 in [u32::MAX, 1 << 31] {
                let mut pic = current(
                    4,
                    vec![RefPicMarkingInner {
                        difference_of_pic_nums_minus1,
                        ..op(mmco)
                    }],
                );
                assert_eq!(
                    dpb.reference_pic_marking(&mut pic, &mut max_long_term_frame_idx, 4),
                    Err(MmcoError::InvalidDifferenceOfPicNums(difference_of_pic_nums_minus1))
                );
            }
        }

        // Representable, but names no picture.
        let mut pic = current(
            4,
            vec![RefPicMarkingInner {
                difference_of_pic_nums_minus1: i32::MAX as u32,
                ..op(1)
            }],
        );
        assert_eq!(
            dpb.reference_pic_marking(&mut pic, &mut max_long_term_frame_idx, 4),
            Err(MmcoError::NoShortTermPic(4 - i32::MAX - 1))
        );

        let mut pic = current(
            4,
            vec![RefPicMarkingInner {
                max_long_term_frame_idx_plus1: i32::MIN,
                ..op(4)
            }],
        );
        assert_eq!(
            dpb.reference_pic_marking(&mut pic, &mut max_long_term_frame_idx, 4),
            Err(MmcoError::InvalidMaxLongTermFrameIdx(i32::MIN))
        );
        assert_eq!(max_long_term_frame_idx, -1);

        assert!(dpb.get(ids[0]).unwrap().is_ref());
    }

    #[test]
    fn mmco_3_replaces_long_term_index() {
        let (mut dpb, ids) = dpb_with_short_terms(&[2, 3]);
        let mut old_lt = frame(0, 0, Reference::LongTerm);
        old_lt.long_term_frame_idx = 1;
        let old_lt = dpb.store_picture(old_lt).unwrap();
        dpb.update_pic_nums(4, 16);

        let mut pic = current(
            4,
            vec![RefPicMarkingInner {
                // pic_num_x = 4 - 2 = 2
                difference_of_pic_nums_minus1: 1,
                long_term_frame_idx: 1,
                ..op(3)
            }],
        );

        let mut max_long_term_frame_idx = 1;
        dpb.reference_pic_marking(&mut pic, &mut max_long_term_frame_idx, 4)
            .unwrap();

        let new_lt = dpb.get(ids[0]).unwrap();
        assert_eq!(new_lt.reference(), Reference::LongTerm);
        assert_eq!(new_lt.long_term_frame_idx, 1);
        assert!(!dpb.get(old_lt).unwrap().is_ref());
        assert_eq!(dpb.get(ids[1]).unwrap().reference(), Reference::ShortTerm);
    }

    #[test]
    fn mmco_3_rejects_non_existing() {
        let mut dpb = Dpb::default();
        dpb.set_max_num_pics(4);
        dpb.store_picture(PictureData::new_non_existing(3, 0)).unwrap();
        dpb.update_pic_nums(4, 16);

        let mut pic = current(4, vec![op(3)]);
        let mut max_long_term_frame_idx = 0;
        assert_eq!(
            dpb.reference_pic_marking(&mut pic, &mut max_long_term_frame_idx, 4),
            Err(MmcoError::ExpectedExisting)
        );
    }

    #[test]
    fn mmco_4() {
        let mut dpb = Dpb::default();
        dpb.set_max_num_pics(4);

        let ids = (0..3)
            .map(|idx| {
                let mut lt = frame(idx, 2 * idx, Reference::LongTerm);
                lt.long_term_frame_idx = idx;
                dpb.store_picture(lt).unwrap()
            })
            .collect::<Vec<_>>();

        let mut pic = current(
            5,
            vec![RefPicMarkingInner {
                max_long_term_frame_idx_plus1: 1,
                ..op(4)
            }],
        );

        let mut max_long_term_frame_idx = 2;
        dpb.reference_pic_marking(&mut pic, &mut max_long_term_frame_idx, 4)
            .unwrap();

        assert_eq!(max_long_term_frame_idx, 0);
        assert!(dpb.get(ids[0]).unwrap().is_ref());
        assert!(!dpb.get(ids[1]).unwrap().is_ref());
        assert!(!dpb.get(ids[2]).unwrap().is_ref());
    }

    #[test]
    fn mmco_5() {
        let (mut dpb, _) = dpb_with_short_terms(&[1, 2]);

        let mut pic = current(3, vec![op(5)]);
        pic.top_field_order_cnt = 6;
        pic.bottom_field_order_cnt = 7;
        pic.pic_order_cnt = 6;

        let mut max_long_term_frame_idx = 2;
        dpb.reference_pic_marking(&mut pic, &mut max_long_term_frame_idx, 4)
            .unwrap();

        assert_eq!(dpb.num_ref_frames(), 0);
        assert!(pic.has_mmco_5);
        assert_eq!(pic.frame_num, 0);
        assert_eq!(pic.top_field_order_cnt, 0);
        assert_eq!(pic.bottom_field_order_cnt, 1);
        assert_eq!(pic.pic_order_cnt, 0);
        assert_eq!(max_long_term_frame_idx, -1);
    }

    #[test]
    fn mmco_6() {
        let mut dpb = Dpb::default();
        dpb.set_max_num_pics(4);
        let mut old_lt = frame(0, 0, Reference::LongTerm);
        old_lt.long_term_frame_idx = 0;
        let old_lt = dpb.store_picture(old_lt).unwrap();

        let mut pic = current(
            1,
            vec![RefPicMarkingInner {
                long_term_frame_idx: 0,
                ..op(6)
            }],
        );

        let mut max_long_term_frame_idx = 0;
        dpb.reference_pic_marking(&mut pic, &mut max_long_term_frame_idx, 4)
            .unwrap();

        assert!(!dpb.get(old_lt).unwrap().is_ref());
        assert_eq!(pic.reference(), Reference::LongTerm);
        assert_eq!(pic.long_term_frame_idx, 0);
    }
}
