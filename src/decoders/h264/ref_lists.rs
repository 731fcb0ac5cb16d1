// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture list construction, see 8.2.4.

use log::debug;
use thiserror::Error;

use crate::decoders::h264::dpb::Dpb;
use crate::decoders::h264::headers::RefPicListModification;
use crate::decoders::h264::headers::SliceHeader;
use crate::decoders::h264::picture::PictureData;
use crate::decoders::h264::picture::PictureId;
use crate::decoders::h264::picture::Reference;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefPicListError {
    #[error("no ShortTerm reference found with pic_num {0}")]
    NoShortTermPic(i32),
    #[error("no LongTerm reference found with long_term_pic_num {0}")]
    NoLongTermPic(i32),
    #[error("unexpected modification_of_pic_nums_idc {0}")]
    InvalidModificationIdc(u8),
    #[error("more modifications than the {0} active entries of the list")]
    TooManyModifications(usize),
    #[error("abs_diff_pic_num_minus1 {0} is not below MaxPicNum")]
    InvalidAbsDiffPicNum(u32),
}

/// A reference picture list as handed to the backend. `None` entries are
/// holes: no reference picture is available at that index.
pub type RefPicList = Vec<Option<PictureId>>;

#[derive(Copy, Clone, Debug)]
enum RefPicListName {
    RefPicList0,
    RefPicList1,
}

/// Builds the reference picture lists of the slices of the current picture.
/// The DPB must not change while a builder is alive, which holds for the
/// whole duration of a picture's decoding.
pub(crate) struct RefPicListBuilder<'a> {
    dpb: &'a Dpb,
    cur_pic: &'a PictureData,
    max_pic_num: i32,
    max_long_term_frame_idx: i32,
}

impl<'a> RefPicListBuilder<'a> {
    pub fn new(
        dpb: &'a Dpb,
        cur_pic: &'a PictureData,
        max_pic_num: i32,
        max_long_term_frame_idx: i32,
    ) -> Self {
        Self {
            dpb,
            cur_pic,
            max_pic_num,
            max_long_term_frame_idx,
        }
    }

    fn sorted_by_key<K: Ord>(
        &self,
        mut ids: Vec<PictureId>,
        key: impl Fn(&PictureData) -> K,
    ) -> Vec<PictureId> {
        ids.sort_by_cached_key(|&id| self.dpb.get(id).map(&key));
        ids
    }

    fn debug_ref_list(&self, ref_pic_list: &[PictureId], ref_pic_list_name: &str) {
        debug!(
            "{}: {:?}",
            ref_pic_list_name,
            ref_pic_list
                .iter()
                .filter_map(|&id| self.dpb.get(id))
                .map(|p| (p.reference(), p.pic_num, p.long_term_pic_num, p.pic_order_cnt))
                .collect::<Vec<_>>()
        );
    }

    /// 8.2.4.2.1 Initialization process for the reference picture list for P
    /// and SP slices in frames
    pub fn init_ref_pic_list_p(&self) -> Vec<PictureId> {
        let mut list = self.sorted_by_key(self.dpb.short_term_refs(), |p| {
            std::cmp::Reverse(p.pic_num)
        });

        list.extend(self.sorted_by_key(self.dpb.long_term_refs(), |p| p.long_term_pic_num));

        self.debug_ref_list(&list, "ref_pic_list_p0");

        list
    }

    /// 8.2.4.2.3 Initialization process for reference picture lists for B
    /// slices in frames
    pub fn init_ref_pic_list_b(&self) -> (Vec<PictureId>, Vec<PictureId>) {
        let cur_poc = self.cur_pic.pic_order_cnt;

        // When pic_order_cnt_type is equal to 0, reference pictures that are
        // marked as "non-existing" as specified in clause 8.2.5.2 are not
        // included in either RefPicList0 or RefPicList1.
        let usable = |ids: Vec<PictureId>| -> Vec<PictureId> {
            ids.into_iter()
                .filter(|&id| {
                    self.dpb.get(id).map_or(false, |p| {
                        !(self.cur_pic.pic_order_cnt_type == 0 && p.nonexisting)
                    })
                })
                .collect()
        };

        let short_term_refs = usable(self.dpb.short_term_refs());
        let long_term_refs = self.sorted_by_key(usable(self.dpb.long_term_refs()), |p| {
            p.long_term_pic_num
        });

        let poc_of = |id: &PictureId| self.dpb.get(*id).map_or(0, |p| p.pic_order_cnt);
        let (before, after): (Vec<_>, Vec<_>) = short_term_refs
            .into_iter()
            .partition(|id| poc_of(id) < cur_poc);

        let before = self.sorted_by_key(before, |p| std::cmp::Reverse(p.pic_order_cnt));
        let after = self.sorted_by_key(after, |p| p.pic_order_cnt);

        // b0: short term pictures with POC < current by descending POC, then
        // short term pictures with POC > current by ascending POC, then long
        // term pictures by ascending long_term_pic_num.
        let mut list0 = before.clone();
        list0.extend(after.iter().copied());
        list0.extend(long_term_refs.iter().copied());

        // b1: the two short term groups swapped.
        let mut list1 = after;
        list1.extend(before);
        list1.extend(long_term_refs);

        // When the reference picture list RefPicList1 has more than one entry
        // and RefPicList1 is identical to the reference picture list
        // RefPicList0, the first two entries RefPicList1[0] and RefPicList1[1]
        // are switched.
        if list1.len() > 1 && list0 == list1 {
            list1.swap(0, 1);
        }

        self.debug_ref_list(&list0, "ref_pic_list_b0");
        self.debug_ref_list(&list1, "ref_pic_list_b1");

        (list0, list1)
    }

    /// Builds the final lists for a slice: initialization followed by the
    /// modification process of 8.2.4.3. Lists have exactly
    /// `num_ref_idx_lX_active_minus1 + 1` entries.
    pub fn build(&self, hdr: &SliceHeader) -> Result<(RefPicList, RefPicList), RefPicListError> {
        if hdr.slice_type.is_p() {
            let list0 = self.modify_ref_pic_list(
                hdr,
                RefPicListName::RefPicList0,
                self.init_ref_pic_list_p(),
            )?;

            Ok((list0, vec![]))
        } else if hdr.slice_type.is_b() {
            let (init0, init1) = self.init_ref_pic_list_b();
            let list0 = self.modify_ref_pic_list(hdr, RefPicListName::RefPicList0, init0)?;
            let list1 = self.modify_ref_pic_list(hdr, RefPicListName::RefPicList1, init1)?;

            Ok((list0, list1))
        } else {
            Ok((vec![], vec![]))
        }
    }

    fn pic_num_f(&self, entry: Option<PictureId>) -> Option<i32> {
        let pic = self.dpb.get(entry?)?;

        if !matches!(pic.reference(), Reference::LongTerm) {
            Some(pic.pic_num)
        } else {
            Some(self.max_pic_num)
        }
    }

    fn long_term_pic_num_f(&self, entry: Option<PictureId>) -> Option<i32> {
        let pic = self.dpb.get(entry?)?;

        if matches!(pic.reference(), Reference::LongTerm) {
            Some(pic.long_term_pic_num)
        } else {
            Some(2 * (self.max_long_term_frame_idx + 1))
        }
    }

    fn modify_ref_pic_list(
        &self,
        hdr: &SliceHeader,
        ref_pic_list: RefPicListName,
        init: Vec<PictureId>,
    ) -> Result<RefPicList, RefPicListError> {
        let (num_ref_idx_lx_active_minus1, modification_flag, rplm) = match ref_pic_list {
            RefPicListName::RefPicList0 => (
                hdr.num_ref_idx_l0_active_minus1,
                hdr.ref_pic_list_modification_flag_l0,
                &hdr.ref_pic_list_modification_l0,
            ),
            RefPicListName::RefPicList1 => (
                hdr.num_ref_idx_l1_active_minus1,
                hdr.ref_pic_list_modification_flag_l1,
                &hdr.ref_pic_list_modification_l1,
            ),
        };

        let num_active = usize::from(num_ref_idx_lx_active_minus1) + 1;

        // The list is one entry longer than needed during modification.
        let mut ref_pic_list_x: RefPicList = init.into_iter().take(num_active).map(Some).collect();
        ref_pic_list_x.resize(num_active + 1, None);

        if modification_flag {
            let mut pic_num_lx_pred = self.cur_pic.pic_num;
            let mut ref_idx_lx = 0;

            for modification in rplm {
                let idc = modification.modification_of_pic_nums_idc;

                if idc == 3 {
                    break;
                }

                if ref_idx_lx >= num_active {
                    return Err(RefPicListError::TooManyModifications(num_active));
                }

                match idc {
                    0 | 1 => self.short_term_pic_list_modification(
                        &mut ref_pic_list_x,
                        modification,
                        &mut pic_num_lx_pred,
                        &mut ref_idx_lx,
                    )?,
                    2 => self.long_term_pic_list_modification(
                        &mut ref_pic_list_x,
                        modification,
                        &mut ref_idx_lx,
                    )?,
                    _ => return Err(RefPicListError::InvalidModificationIdc(idc)),
                }
            }
        }

        ref_pic_list_x.truncate(num_active);

        Ok(ref_pic_list_x)
    }

    /// Inserts `pic` at `ref_idx_lx` and removes the later duplicates of it,
    /// as identified by `same_pic`.
    fn insert_and_compact(
        ref_pic_list_x: &mut RefPicList,
        pic: PictureId,
        ref_idx_lx: &mut usize,
        same_pic: impl Fn(Option<PictureId>) -> bool,
    ) {
        let last = ref_pic_list_x.len() - 1;

        for cidx in (*ref_idx_lx + 1..=last).rev() {
            ref_pic_list_x[cidx] = ref_pic_list_x[cidx - 1];
        }

        ref_pic_list_x[*ref_idx_lx] = Some(pic);
        *ref_idx_lx += 1;

        let mut nidx = *ref_idx_lx;

        for cidx in *ref_idx_lx..=last {
            if !same_pic(ref_pic_list_x[cidx]) {
                ref_pic_list_x[nidx] = ref_pic_list_x[cidx];
                nidx += 1;
            }
        }

        for entry in &mut ref_pic_list_x[nidx..] {
            *entry = None;
        }
    }

    // 8.2.4.3.1 Modification process of reference picture lists for short-term
    // reference pictures
    fn short_term_pic_list_modification(
        &self,
        ref_pic_list_x: &mut RefPicList,
        rplm: &RefPicListModification,
        pic_num_lx_pred: &mut i32,
        ref_idx_lx: &mut usize,
    ) -> Result<(), RefPicListError> {
        // abs_diff_pic_num_minus1 is in the range 0..MaxPicNum, which keeps
        // picNumLXPred in that range as well.
        let abs_diff_pic_num = i32::try_from(rplm.abs_diff_pic_num_minus1)
            .ok()
            .filter(|&diff| diff < self.max_pic_num)
            .ok_or(RefPicListError::InvalidAbsDiffPicNum(rplm.abs_diff_pic_num_minus1))?
            + 1;

        let pic_num_lx_no_wrap = if rplm.modification_of_pic_nums_idc == 0 {
            if *pic_num_lx_pred - abs_diff_pic_num < 0 {
                *pic_num_lx_pred - abs_diff_pic_num + self.max_pic_num
            } else {
                *pic_num_lx_pred - abs_diff_pic_num
            }
        } else if *pic_num_lx_pred + abs_diff_pic_num >= self.max_pic_num {
            *pic_num_lx_pred + abs_diff_pic_num - self.max_pic_num
        } else {
            *pic_num_lx_pred + abs_diff_pic_num
        };

        *pic_num_lx_pred = pic_num_lx_no_wrap;

        let pic_num_lx = if pic_num_lx_no_wrap > self.cur_pic.pic_num {
            pic_num_lx_no_wrap - self.max_pic_num
        } else {
            pic_num_lx_no_wrap
        };

        let pic = self
            .dpb
            .find_short_term_with_pic_num(pic_num_lx)
            .ok_or(RefPicListError::NoShortTermPic(pic_num_lx))?;

        Self::insert_and_compact(ref_pic_list_x, pic, ref_idx_lx, |entry| {
            self.pic_num_f(entry) == Some(pic_num_lx)
        });

        Ok(())
    }

    // 8.2.4.3.2 Modification process of reference picture lists for long-term
    // reference pictures
    fn long_term_pic_list_modification(
        &self,
        ref_pic_list_x: &mut RefPicList,
        rplm: &RefPicListModification,
        ref_idx_lx: &mut usize,
    ) -> Result<(), RefPicListError> {
        let long_term_pic_num = i32::try_from(rplm.long_term_pic_num).unwrap_or(i32::MAX);

        let pic = self
            .dpb
            .find_long_term_with_long_term_pic_num(long_term_pic_num)
            .ok_or(RefPicListError::NoLongTermPic(long_term_pic_num))?;

        Self::insert_and_compact(ref_pic_list_x, pic, ref_idx_lx, |entry| {
            self.long_term_pic_num_f(entry) == Some(long_term_pic_num)
        });

        Ok(())
    }
}
