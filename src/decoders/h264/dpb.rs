// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;
use thiserror::Error;

use crate::decoders::h264::picture::PictureData;
use crate::decoders::h264::picture::PictureId;
use crate::decoders::h264::picture::Reference;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StorePictureError {
    #[error("DPB is full ({0} pictures)")]
    DpbIsFull(usize),
}

/// A picture stored in the DPB along with its identity.
#[derive(Clone, Debug)]
pub struct DpbEntry {
    pub id: PictureId,
    pub pic: PictureData,
}

#[derive(Default)]
pub struct Dpb {
    /// The list of decoded pictures, in storage order.
    entries: Vec<DpbEntry>,
    /// The maximum number of pictures that can be stored.
    max_num_pics: usize,
    /// Identity given to the next stored picture.
    next_id: u64,
}

impl Dpb {
    /// Returns an iterator over the stored pictures.
    pub fn pictures(&self) -> impl Iterator<Item = &PictureData> {
        self.entries.iter().map(|e| &e.pic)
    }

    fn pictures_mut(&mut self) -> impl Iterator<Item = &mut PictureData> {
        self.entries.iter_mut().map(|e| &mut e.pic)
    }

    /// Get a reference to the dpb's entries.
    pub fn entries(&self) -> &[DpbEntry] {
        &self.entries
    }

    pub fn get(&self, id: PictureId) -> Option<&PictureData> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.pic)
    }

    pub fn get_mut(&mut self, id: PictureId) -> Option<&mut PictureData> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .map(|e| &mut e.pic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set the dpb's max num pics.
    pub fn set_max_num_pics(&mut self, max_num_pics: usize) {
        self.max_num_pics = max_num_pics;
    }

    /// Get a reference to the dpb's max num pics.
    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    /// Returns the number of reference frames.
    pub fn num_ref_frames(&self) -> usize {
        self.pictures().filter(|p| p.is_ref()).count()
    }

    /// Returns the number of pictures waiting to be output.
    pub fn num_needed_for_output(&self) -> usize {
        self.pictures().filter(|p| p.needed_for_output).count()
    }

    /// Find the short term reference picture with the lowest `frame_num_wrap`
    /// value.
    pub fn find_short_term_lowest_frame_num_wrap(&self) -> Option<PictureId> {
        self.entries
            .iter()
            .filter(|e| matches!(e.pic.reference(), Reference::ShortTerm))
            .min_by_key(|e| e.pic.frame_num_wrap)
            .map(|e| e.id)
    }

    /// Mark all pictures in the DPB as unused for reference.
    pub fn mark_all_as_unused_for_ref(&mut self) {
        for picture in self.pictures_mut() {
            picture.set_reference(Reference::None);
        }
    }

    /// Remove unused pictures from the DPB. A picture is not going to be used
    /// anymore if it's a) not a reference and b) not needed for output
    pub fn remove_unused(&mut self) {
        self.entries.retain(|entry| {
            let pic = &entry.pic;
            let discard = !pic.is_ref() && !pic.needed_for_output;

            if discard {
                debug!("Removing unused picture {:?}", pic);
            }

            !discard
        });
    }

    /// Remove every picture that was already output or will never be,
    /// whether it is still a reference or not.
    pub fn remove_outputted(&mut self) {
        self.entries.retain(|entry| {
            if !entry.pic.needed_for_output {
                debug!("Removing outputted picture POC {}", entry.pic.pic_order_cnt);
            }

            entry.pic.needed_for_output
        });
    }

    /// Remove the picture with the given POC, returning it.
    pub fn remove_by_poc(&mut self, pic_order_cnt: i32) -> Option<PictureData> {
        let position = self
            .entries
            .iter()
            .position(|e| e.pic.pic_order_cnt == pic_order_cnt)?;

        debug!("Removing picture POC {} from the DPB", pic_order_cnt);

        Some(self.entries.remove(position).pic)
    }

    /// Find a short term reference picture with the given `pic_num` value.
    pub fn find_short_term_with_pic_num(&self, pic_num: i32) -> Option<PictureId> {
        let found = self
            .entries
            .iter()
            .find(|e| matches!(e.pic.reference(), Reference::ShortTerm) && e.pic.pic_num == pic_num)
            .map(|e| e.id);

        debug!(
            "find_short_term_with_pic_num: {}, found {:?}",
            pic_num, found
        );

        found
    }

    /// Find a long term reference picture with the given `long_term_pic_num`
    /// value.
    pub fn find_long_term_with_long_term_pic_num(
        &self,
        long_term_pic_num: i32,
    ) -> Option<PictureId> {
        let found = self
            .entries
            .iter()
            .find(|e| {
                matches!(e.pic.reference(), Reference::LongTerm)
                    && e.pic.long_term_pic_num == long_term_pic_num
            })
            .map(|e| e.id);

        debug!(
            "find_long_term_with_long_term_pic_num: {}, found {:?}",
            long_term_pic_num, found
        );

        found
    }

    /// Store a picture in the DPB, returning the identity it will be known
    /// by from now on.
    pub fn store_picture(&mut self, pic: PictureData) -> Result<PictureId, StorePictureError> {
        if self.is_full() {
            return Err(StorePictureError::DpbIsFull(self.entries.len()));
        }

        let id = PictureId(self.next_id);
        self.next_id += 1;

        debug!(
            "Stored picture POC {:?} as {:?}, the DPB length is {:?}",
            pic.pic_order_cnt,
            id,
            self.entries.len() + 1
        );

        self.entries.push(DpbEntry { id, pic });

        Ok(id)
    }

    /// Whether the DPB has an empty slot for a new picture.
    pub fn has_empty_frame_buffer(&self) -> bool {
        self.entries.len() < self.max_num_pics
    }

    pub fn is_full(&self) -> bool {
        !self.has_empty_frame_buffer()
    }

    /// Updates `frame_num_wrap`, `pic_num` and `long_term_pic_num` of every
    /// reference picture relative to the picture with `frame_num`. See
    /// 8.2.4.1.
    pub fn update_pic_nums(&mut self, frame_num: i32, max_frame_num: i32) {
        for pic in self.pictures_mut() {
            match pic.reference() {
                Reference::None => continue,
                Reference::LongTerm => pic.long_term_pic_num = pic.long_term_frame_idx,
                Reference::ShortTerm => {
                    if pic.frame_num > frame_num {
                        pic.frame_num_wrap = pic.frame_num - max_frame_num;
                    } else {
                        pic.frame_num_wrap = pic.frame_num;
                    }

                    pic.pic_num = pic.frame_num_wrap;
                }
            }
        }
    }

    /// Find the picture with the lowest POC that still needs to be output.
    pub fn find_lowest_poc_for_bumping(&self) -> Option<PictureId> {
        self.entries
            .iter()
            .filter(|e| e.pic.needed_for_output)
            .min_by_key(|e| e.pic.pic_order_cnt)
            .map(|e| e.id)
    }

    /// Bump the dpb, returning a picture as per the bumping process described
    /// in C.4.5.3. A picture that is still a reference stays in the DPB, and a
    /// copy is returned, unless `flush` is set.
    pub fn bump(&mut self, flush: bool) -> Option<PictureData> {
        let id = self.find_lowest_poc_for_bumping()?;
        let position = self.entries.iter().position(|e| e.id == id)?;
        let pic = &mut self.entries[position].pic;

        debug!("Bumping picture {:?} from the dpb", pic);

        pic.needed_for_output = false;

        if !pic.is_ref() || flush {
            debug!("removed picture POC {} from dpb", pic.pic_order_cnt);
            return Some(self.entries.remove(position).pic);
        }

        Some(pic.clone())
    }

    /// Drains the DPB by continuously invoking the bumping process, then drops
    /// whatever is left.
    pub fn drain(&mut self) -> Vec<PictureData> {
        debug!("Draining the DPB.");

        let mut pics = vec![];

        while let Some(pic) = self.bump(true) {
            pics.push(pic);
        }

        self.remove_outputted();

        pics
    }

    /// Clears the DPB, dropping all the pictures.
    pub fn clear(&mut self) {
        debug!("Clearing the DPB");

        self.entries.clear();
    }

    /// Gets the ids of the short term refs.
    pub fn short_term_refs(&self) -> Vec<PictureId> {
        self.entries
            .iter()
            .filter(|e| matches!(e.pic.reference(), Reference::ShortTerm))
            .map(|e| e.id)
            .collect()
    }

    /// Gets the ids of the long term refs.
    pub fn long_term_refs(&self) -> Vec<PictureId> {
        self.entries
            .iter()
            .filter(|e| matches!(e.pic.reference(), Reference::LongTerm))
            .map(|e| e.id)
            .collect()
    }
}

impl std::fmt::Debug for Dpb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pics = self
            .entries
            .iter()
            .map(|e| (e.id, &e.pic))
            .collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("pictures", &pics)
            .field("max_num_pics", &self.max_num_pics)
            .finish()
    }
}
