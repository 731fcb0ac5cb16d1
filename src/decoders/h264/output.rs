// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The output ("bumping") process of C.4.5.3 and the queue of pictures that
//! are ready to be handed to the backend.

use std::collections::VecDeque;

use log::debug;
use log::warn;
use thiserror::Error;

use crate::decoders::h264::dpb::Dpb;
use crate::decoders::h264::dpb::StorePictureError;
use crate::decoders::h264::picture::PictureData;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BumpingError {
    #[error("DPB overflow: nothing left to bump to make room for POC {poc}")]
    DpbOverflow { poc: i32, source: StorePictureError },
}

#[derive(Debug, Default)]
pub(crate) struct OutputScheduler {
    /// Pictures in output order, waiting to be handed to the backend.
    ready: VecDeque<PictureData>,
    /// Number of pictures kept in `ready` after they have been bumped.
    output_delay: usize,
    /// Bump pictures as soon as the POC sequence suggests nothing will be
    /// inserted before them.
    low_latency: bool,
    /// POC of the last picture queued for output since the last drain.
    last_output_poc: Option<i32>,
}

impl OutputScheduler {
    pub fn new(output_delay: usize, low_latency: bool) -> Self {
        Self {
            output_delay,
            low_latency,
            ..Default::default()
        }
    }

    pub fn set_low_latency(&mut self, low_latency: bool) {
        self.low_latency = low_latency;
    }

    pub fn output_delay(&self) -> usize {
        self.output_delay
    }

    pub fn last_output_poc(&self) -> Option<i32> {
        self.last_output_poc
    }

    fn queue(&mut self, pic: PictureData) {
        debug!(
            "Outputting picture frame_num {}, POC {}",
            pic.frame_num, pic.pic_order_cnt
        );

        if let Some(last_output_poc) = self.last_output_poc {
            if pic.pic_order_cnt < last_output_poc {
                warn!(
                    "Outputting out of order {} -> {}, likely a broken stream",
                    last_output_poc, pic.pic_order_cnt
                );
            }
        }

        self.last_output_poc = Some(pic.pic_order_cnt);
        self.ready.push_back(pic);
    }

    /// Runs the bumping process for `cur_pic`, which has just been decoded and
    /// marked, then stores it in the DPB if it is still needed there.
    ///
    /// `cur_pic` is itself a candidate for output when it still needs to be
    /// output, in which case it may be output directly without ever reaching
    /// the DPB.
    pub fn bump_and_store(
        &mut self,
        dpb: &mut Dpb,
        mut cur_pic: PictureData,
        max_num_reorder_frames: usize,
    ) -> Result<(), BumpingError> {
        let needs_slot = |pic: &PictureData| pic.is_ref() || pic.needed_for_output;

        loop {
            let cur_is_candidate = cur_pic.needed_for_output && !cur_pic.nonexisting;
            let num_candidates = dpb.num_needed_for_output() + usize::from(cur_is_candidate);

            if num_candidates <= max_num_reorder_frames
                && !(dpb.is_full() && needs_slot(&cur_pic))
            {
                break;
            }

            let lowest_dpb_poc = dpb
                .find_lowest_poc_for_bumping()
                .and_then(|id| dpb.get(id))
                .map(|p| p.pic_order_cnt);

            let output_cur =
                cur_is_candidate && lowest_dpb_poc.map_or(true, |poc| cur_pic.pic_order_cnt < poc);

            if output_cur {
                debug!("Outputting the current picture directly");

                cur_pic.needed_for_output = false;
                self.queue(cur_pic.clone());
                continue;
            }

            match dpb.bump(false) {
                Some(pic) => self.queue(pic),
                None => {
                    warn!("Bumping is needed but no picture to output");
                    break;
                }
            }
        }

        if needs_slot(&cur_pic) {
            let poc = cur_pic.pic_order_cnt;
            dpb.store_picture(cur_pic)
                .map_err(|source| BumpingError::DpbOverflow { poc, source })?;
        }

        if self.low_latency {
            self.bump_low_latency(dpb);
        }

        Ok(())
    }

    /// Outputs the pictures that the POC sequence suggests nothing will be
    /// inserted before: IDR pictures, pictures with MMCO 5 and pictures at
    /// most one frame ahead of the last output. This trades a risk of out of
    /// order output for latency.
    fn bump_low_latency(&mut self, dpb: &mut Dpb) {
        while let Some(pic) = dpb.find_lowest_poc_for_bumping().and_then(|id| dpb.get(id)) {
            let follows_last_output = self
                .last_output_poc
                .map_or(false, |last| pic.pic_order_cnt <= last + 2);

            if !(pic.is_idr() || pic.has_mmco_5 || follows_last_output) {
                break;
            }

            match dpb.bump(false) {
                Some(pic) => self.queue(pic),
                None => break,
            }
        }
    }

    /// Outputs every picture left in the DPB, in POC order, and empties it.
    pub fn drain_dpb(&mut self, dpb: &mut Dpb) {
        for pic in dpb.drain() {
            self.queue(pic);
        }

        dpb.clear();
        self.reset_output_order();
    }

    /// Forgets the last output POC, once the POC sequence restarts.
    pub fn reset_output_order(&mut self) {
        self.last_output_poc = None;
    }

    /// Returns the next picture that can be handed to the backend, keeping
    /// `output_delay` pictures queued.
    pub fn pop_ready(&mut self) -> Option<PictureData> {
        if self.ready.len() > self.output_delay {
            self.ready.pop_front()
        } else {
            None
        }
    }

    /// Returns the next queued picture regardless of the output delay.
    pub fn pop_any(&mut self) -> Option<PictureData> {
        self.ready.pop_front()
    }

    pub fn num_queued(&self) -> usize {
        self.ready.len()
    }

    /// Drops every queued picture without outputting it.
    pub fn clear(&mut self) {
        self.ready.clear();
        self.reset_output_order();
    }
}
