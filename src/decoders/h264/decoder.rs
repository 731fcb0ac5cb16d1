// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::borrow::Cow;
use std::collections::BTreeMap;

use anyhow::anyhow;
use anyhow::Context;
use log::debug;
use log::warn;

use crate::decoders::h264::backends::StatelessDecoderBackend;
use crate::decoders::h264::dpb::Dpb;
use crate::decoders::h264::headers::Nalu;
use crate::decoders::h264::headers::Pps;
use crate::decoders::h264::headers::Slice;
use crate::decoders::h264::headers::SliceHeader;
use crate::decoders::h264::headers::Sps;
use crate::decoders::h264::output::OutputScheduler;
use crate::decoders::h264::picture::PictureData;
use crate::decoders::h264::picture::PictureId;
use crate::decoders::h264::poc::PocState;
use crate::decoders::h264::ref_lists::RefPicListBuilder;
use crate::decoders::h264::sequence::SequenceParams;
use crate::decoders::DecodeError;
use crate::decoders::DecoderConfig;
use crate::decoders::Result;

/// The SPS the current sequence was started with, and what was derived from
/// it.
struct ActiveSequence {
    sps: Sps,
    params: SequenceParams,
}

/// The picture whose slices are being decoded.
struct CurrentPicture {
    pic: PictureData,
    pps: Pps,
}

fn resolve_ref_pic_list<'a>(
    dpb: &'a Dpb,
    list: &[Option<PictureId>],
) -> Vec<Option<&'a PictureData>> {
    list.iter()
        .map(|entry| entry.and_then(|id| dpb.get(id)))
        .collect()
}

/// Decodes H.264 streams with a stateless backend: the decoder takes care of
/// picture order, reference management and output order, and the backend of
/// reconstructing and presenting the pictures.
///
/// NAL units are fed one at a time, already parsed, through
/// [`Decoder::process_nal`]. A picture is finished when the first slice of the
/// next one arrives, at an access unit boundary, or on [`Decoder::drain`].
pub struct Decoder<B: StatelessDecoderBackend> {
    /// The backend used for hardware acceleration.
    backend: B,

    config: DecoderConfig,

    /// Parameter sets received so far, by id.
    sps: BTreeMap<u8, Sps>,
    pps: BTreeMap<u8, Pps>,

    active: Option<ActiveSequence>,

    /// The decoded picture buffer.
    dpb: Dpb,

    poc: PocState,
    output: OutputScheduler,

    /// MaxLongTermFrameIdx, -1 meaning "no long-term frame indices".
    max_long_term_frame_idx: i32,

    cur_pic: Option<CurrentPicture>,

    /// Set after a fatal error, until `reset()`.
    halted: bool,
}

impl<B: StatelessDecoderBackend> Decoder<B> {
    pub fn new(backend: B, config: DecoderConfig) -> Self {
        let output = OutputScheduler::new(config.output_delay, config.low_latency);

        Self {
            backend,
            config,
            sps: Default::default(),
            pps: Default::default(),
            active: None,
            dpb: Default::default(),
            poc: Default::default(),
            output,
            max_long_term_frame_idx: -1,
            cur_pic: None,
            halted: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn dpb(&self) -> &Dpb {
        &self.dpb
    }

    /// The parameters of the active sequence, if an SPS has been activated.
    pub fn sequence(&self) -> Option<&SequenceParams> {
        self.active.as_ref().map(|a| &a.params)
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn set_low_latency(&mut self, low_latency: bool) {
        debug!("Low latency output: {}", low_latency);

        self.config.low_latency = low_latency;
        self.output.set_low_latency(low_latency);
    }

    fn check_halted(&self) -> Result<()> {
        if self.halted {
            Err(DecodeError::Halted)
        } else {
            Ok(())
        }
    }

    fn note_fatal(&mut self, res: Result<()>) -> Result<()> {
        if let Err(e) = &res {
            if e.is_fatal() {
                warn!("Halting the decoder: {}", e);
                self.halted = true;
            }
        }

        res
    }

    /// Processes one parsed NAL unit. `timestamp` is handed back with the
    /// picture started by this NAL unit, if any, when it is output.
    ///
    /// On error, the NAL unit (and for slices, the picture it belongs to) is
    /// dropped and the decoder is ready for the next NAL unit, unless the
    /// error is fatal.
    pub fn process_nal(&mut self, timestamp: u64, nalu: &Nalu) -> Result<()> {
        self.check_halted()?;

        let res = match nalu {
            Nalu::Sps(sps) => {
                let finished = self.finish_picture();
                finished.and(self.process_sps(sps))
            }
            Nalu::Pps(pps) => self.process_pps(pps),
            Nalu::Slice(slice) => self.handle_slice(timestamp, slice),
            Nalu::AccessUnitDelimiter | Nalu::EndOfSequence | Nalu::EndOfStream => {
                self.finish_picture()
            }
            Nalu::Other(type_) => {
                debug!("Ignoring NAL unit of type {:?}", type_);
                Ok(())
            }
        };

        self.note_fatal(res)
    }

    /// Signals the end of an access unit: the current picture, if any, is
    /// complete.
    pub fn end_access_unit(&mut self) -> Result<()> {
        self.check_halted()?;

        let res = self.finish_picture();
        self.note_fatal(res)
    }

    /// Finishes the current picture and outputs every buffered picture, e.g.
    /// at the end of the stream.
    pub fn drain(&mut self) -> Result<()> {
        self.check_halted()?;

        let finished = self.finish_picture();
        let res = finished.and(self.drain_all());
        self.note_fatal(res)
    }

    /// Drops the current picture and every buffered picture without output,
    /// e.g. on seek.
    pub fn flush(&mut self) -> Result<()> {
        self.check_halted()?;

        self.flush_internal();
        Ok(())
    }

    /// Leaves the halted state. The next SPS or slice starts a new sequence.
    pub fn reset(&mut self) {
        debug!("Resetting the decoder");

        self.halted = false;
        self.flush_internal();
        self.active = None;
        self.dpb.set_max_num_pics(0);
    }

    fn flush_internal(&mut self) {
        debug!("Flushing the decoder");

        self.cur_pic = None;
        self.dpb.clear();
        self.output.clear();
        self.poc = Default::default();
        self.max_long_term_frame_idx = -1;
    }

    fn process_sps(&mut self, sps: &Sps) -> Result<()> {
        let params = SequenceParams::from_sps(sps, self.config.compliance)
            .with_context(|| format!("Invalid SPS {}", sps.seq_parameter_set_id))
            .map_err(DecodeError::Parse)?;

        self.sps.insert(sps.seq_parameter_set_id, sps.clone());

        let is_active_id = self
            .active
            .as_ref()
            .map_or(true, |a| a.sps.seq_parameter_set_id == sps.seq_parameter_set_id);

        // Other SPSs become active when a slice refers to them.
        if is_active_id {
            self.activate_sequence(sps.clone(), params)?;
        }

        Ok(())
    }

    fn activate_sps(&mut self, sps_id: u8) -> Result<()> {
        let sps = self
            .sps
            .get(&sps_id)
            .cloned()
            .with_context(|| format!("Unknown SPS {}", sps_id))
            .map_err(DecodeError::Parse)?;

        let params = SequenceParams::from_sps(&sps, self.config.compliance)
            .with_context(|| format!("Invalid SPS {}", sps_id))
            .map_err(DecodeError::Parse)?;

        self.activate_sequence(sps, params)
    }

    fn activate_sequence(&mut self, sps: Sps, params: SequenceParams) -> Result<()> {
        let needs_new_sequence = self
            .active
            .as_ref()
            .map_or(true, |a| a.params.needs_new_sequence(&params));

        if needs_new_sequence {
            debug!(
                "New sequence: {}x{}, DPB size {}, reorder depth {}",
                params.coded_resolution.width,
                params.coded_resolution.height,
                params.max_dpb_size,
                params.max_num_reorder_frames
            );

            self.drain_all()?;

            let dpb_size = params.max_dpb_size + self.output.output_delay();
            self.backend
                .new_sequence(&sps, dpb_size)
                .context("The backend rejected the new sequence")
                .map_err(DecodeError::Fatal)?;

            self.dpb.set_max_num_pics(params.max_dpb_size);
        }

        self.active = Some(ActiveSequence { sps, params });

        Ok(())
    }

    fn process_pps(&mut self, pps: &Pps) -> Result<()> {
        if pps.num_slice_groups_minus1 > 0 {
            return Err(DecodeError::Parse(anyhow!(
                "PPS {} uses {} slice groups, FMO is not supported",
                pps.pic_parameter_set_id,
                pps.num_slice_groups_minus1 + 1
            )));
        }

        self.pps.insert(pps.pic_parameter_set_id, pps.clone());

        Ok(())
    }

    fn handle_slice(&mut self, timestamp: u64, slice: &Slice) -> Result<()> {
        let hdr = &slice.header;

        if hdr.field_pic_flag {
            return Err(DecodeError::Structural(anyhow!(
                "Field pictures are not supported"
            )));
        }

        if self.cur_pic.is_some() && hdr.first_mb_in_slice == 0 {
            // A new picture starts even if the previous one could not be
            // finished.
            let finished = self.finish_picture();
            return finished.and(self.start_and_decode(timestamp, slice));
        }

        if self.cur_pic.is_none() {
            return self.start_and_decode(timestamp, slice);
        }

        self.decode_slice(slice)
    }

    fn start_and_decode(&mut self, timestamp: u64, slice: &Slice) -> Result<()> {
        if slice.header.first_mb_in_slice != 0 {
            return Err(DecodeError::Structural(anyhow!(
                "The first slice of a picture starts at macroblock {}",
                slice.header.first_mb_in_slice
            )));
        }

        self.start_picture(timestamp, slice)?;
        self.decode_slice(slice)
    }

    /// Whether `frame_num` skips frames since the previous reference picture.
    /// Nothing can be missing from an empty DPB.
    fn has_frame_num_gap(&self, frame_num: i32, max_frame_num: i32) -> bool {
        let prev_ref_frame_num = self.poc.prev_ref_frame_num();

        !self.dpb.is_empty()
            && frame_num != prev_ref_frame_num
            && frame_num != (prev_ref_frame_num + 1) % max_frame_num
    }

    fn handle_frame_num_gap(
        &mut self,
        frame_num: i32,
        timestamp: u64,
        seq: &SequenceParams,
    ) -> Result<()> {
        debug!("frame_num gap detected.");

        let mut unused_short_term_frame_num =
            (self.poc.prev_ref_frame_num() + 1) % seq.max_frame_num;

        while unused_short_term_frame_num != frame_num {
            let mut pic = PictureData::new_non_existing(unused_short_term_frame_num, timestamp);
            pic.pic_order_cnt_type = seq.pic_order_cnt_type;

            self.poc
                .compute_pic_order_count(&mut pic, seq)
                .context("While computing the POC of a frame_num gap")
                .map_err(DecodeError::Structural)?;

            self.dpb
                .update_pic_nums(unused_short_term_frame_num, seq.max_frame_num);

            self.dpb
                .sliding_window_marking(seq.max_num_ref_frames)
                .context("While marking a frame_num gap")
                .map_err(DecodeError::Structural)?;

            self.poc.fill_gap_frame_info(&pic);
            self.dpb.remove_unused();

            self.output
                .bump_and_store(&mut self.dpb, pic, seq.max_num_reorder_frames)
                .context("While storing a frame_num gap")
                .map_err(DecodeError::Resource)?;

            self.output_ready_pictures()?;

            unused_short_term_frame_num += 1;
            unused_short_term_frame_num %= seq.max_frame_num;
        }

        Ok(())
    }

    fn start_picture(&mut self, timestamp: u64, slice: &Slice) -> Result<()> {
        let hdr = &slice.header;

        let pps = self
            .pps
            .get(&hdr.pic_parameter_set_id)
            .cloned()
            .with_context(|| format!("Slice refers to unknown PPS {}", hdr.pic_parameter_set_id))
            .map_err(DecodeError::Parse)?;

        let active_sps_id = self.active.as_ref().map(|a| a.sps.seq_parameter_set_id);
        if active_sps_id != Some(pps.seq_parameter_set_id) {
            self.activate_sps(pps.seq_parameter_set_id)?;
        }

        let seq = self
            .sequence()
            .cloned()
            .context("No active sequence")
            .map_err(DecodeError::Parse)?;

        let frame_num = i32::from(hdr.frame_num);
        if frame_num >= seq.max_frame_num {
            return Err(DecodeError::Parse(anyhow!(
                "frame_num {} is out of range, MaxFrameNum is {}",
                frame_num,
                seq.max_frame_num
            )));
        }

        if slice.nalu_header.idr_pic_flag {
            self.poc.reset_prev_ref_frame_num();
        }

        if self.has_frame_num_gap(frame_num, seq.max_frame_num) {
            if seq.gaps_in_frame_num_value_allowed {
                self.handle_frame_num_gap(frame_num, timestamp, &seq)?;
            } else {
                warn!(
                    "Unexpected frame_num {} after {}, maybe frame drop",
                    frame_num,
                    self.poc.prev_ref_frame_num()
                );
            }
        }

        let mut pic = PictureData::new_from_slice(slice, &seq, timestamp);

        self.poc
            .compute_pic_order_count(&mut pic, &seq)
            .context("While computing the POC")
            .map_err(DecodeError::Structural)?;

        self.backend
            .new_picture(&pic, timestamp)
            .context("new_picture failed")
            .map_err(DecodeError::Resource)?;

        if pic.is_idr() {
            if pic.ref_pic_marking.no_output_of_prior_pics_flag {
                debug!("IDR with no_output_of_prior_pics_flag, dropping the DPB");
                self.dpb.clear();
                self.output.reset_output_order();
            } else {
                self.output.drain_dpb(&mut self.dpb);
                self.output_ready_pictures()?;
            }
        }

        self.dpb.update_pic_nums(frame_num, seq.max_frame_num);

        let sps = match &self.active {
            Some(active) => &active.sps,
            None => return Err(DecodeError::Parse(anyhow!("No active sequence"))),
        };

        self.backend
            .start_picture(&pic, sps, &pps, &self.dpb, slice)
            .context("start_picture failed")
            .map_err(DecodeError::Resource)?;

        self.cur_pic = Some(CurrentPicture { pic, pps });

        Ok(())
    }

    /// Builds the reference picture lists of `slice` and submits it. The
    /// current picture is dropped if this fails.
    fn decode_slice(&mut self, slice: &Slice) -> Result<()> {
        let res = self.submit_slice(slice);

        if res.is_err() {
            if let Some(cur) = self.cur_pic.take() {
                debug!(
                    "Dropping picture frame_num {}, POC {}",
                    cur.pic.frame_num, cur.pic.pic_order_cnt
                );
            }
        }

        res
    }

    fn submit_slice(&mut self, slice: &Slice) -> Result<()> {
        let cur = self
            .cur_pic
            .as_ref()
            .context("No picture is being decoded")
            .map_err(DecodeError::Structural)?;

        let active = self
            .active
            .as_ref()
            .context("No active sequence")
            .map_err(DecodeError::Parse)?;

        // 7.4.3: without an override the PPS defaults apply.
        let hdr = if slice.header.num_ref_idx_active_override_flag {
            Cow::Borrowed(&slice.header)
        } else {
            Cow::Owned(SliceHeader {
                num_ref_idx_l0_active_minus1: cur.pps.num_ref_idx_l0_default_active_minus1,
                num_ref_idx_l1_active_minus1: cur.pps.num_ref_idx_l1_default_active_minus1,
                ..slice.header.clone()
            })
        };

        let (ref_pic_list0, ref_pic_list1) = RefPicListBuilder::new(
            &self.dpb,
            &cur.pic,
            active.params.max_frame_num,
            self.max_long_term_frame_idx,
        )
        .build(&hdr)
        .context("While building the reference picture lists")
        .map_err(DecodeError::Structural)?;

        let ref_pic_list0 = resolve_ref_pic_list(&self.dpb, &ref_pic_list0);
        let ref_pic_list1 = resolve_ref_pic_list(&self.dpb, &ref_pic_list1);

        self.backend
            .decode_slice(
                slice,
                &active.sps,
                &cur.pps,
                &ref_pic_list0,
                &ref_pic_list1,
            )
            .context("decode_slice failed")
            .map_err(DecodeError::Resource)
    }

    fn finish_picture(&mut self) -> Result<()> {
        let mut pic = match self.cur_pic.take() {
            Some(cur) => cur.pic,
            None => return Ok(()),
        };

        debug!(
            "Finishing picture POC {}, last output POC {:?}",
            pic.pic_order_cnt,
            self.output.last_output_poc()
        );

        let (max_num_ref_frames, max_num_reorder_frames) = self
            .sequence()
            .map(|seq| (seq.max_num_ref_frames, seq.max_num_reorder_frames))
            .context("No active sequence")
            .map_err(DecodeError::Parse)?;

        if let Err(e) = self.backend.end_picture(&pic) {
            // The picture keeps its reference role so later pictures still
            // find it, but it is never presented.
            warn!(
                "end_picture failed for POC {}, the picture will not be output: {}",
                pic.pic_order_cnt, e
            );

            pic.nonexisting = true;
            pic.needed_for_output = false;
        }

        if pic.is_ref() {
            self.dpb
                .reference_pic_marking(
                    &mut pic,
                    &mut self.max_long_term_frame_idx,
                    max_num_ref_frames,
                )
                .with_context(|| {
                    format!("Reference marking failed for frame_num {}", pic.frame_num)
                })
                .map_err(DecodeError::Structural)?;

            self.poc.fill_prev_ref_info(&pic);
        }

        self.poc.fill_prev_info(&pic);

        self.dpb.remove_unused();

        if pic.has_mmco_5 {
            // C.4.5.3 "Bumping process"
            // The bumping process is invoked in the following cases:
            // Clause 3:
            // The current picture has memory_management_control_operation equal
            // to 5, as specified in clause C.4.4.
            self.output.drain_dpb(&mut self.dpb);
        }

        self.output
            .bump_and_store(&mut self.dpb, pic, max_num_reorder_frames)
            .context("While storing the decoded picture")
            .map_err(DecodeError::Resource)?;

        self.output_ready_pictures()
    }

    /// Hands the pictures that went past the output delay to the backend.
    fn output_ready_pictures(&mut self) -> Result<()> {
        while let Some(pic) = self.output.pop_ready() {
            self.backend
                .output_picture(pic.timestamp, pic)
                .context("output_picture failed")
                .map_err(DecodeError::Resource)?;
        }

        Ok(())
    }

    /// Outputs everything left in the DPB and in the output queue.
    fn drain_all(&mut self) -> Result<()> {
        debug!(
            "Draining the decoder, {} pictures in the DPB, {} queued for output",
            self.dpb.len(),
            self.output.num_queued()
        );

        self.output.drain_dpb(&mut self.dpb);

        while let Some(pic) = self.output.pop_any() {
            self.backend
                .output_picture(pic.timestamp, pic)
                .context("output_picture failed")
                .map_err(DecodeError::Resource)?;
        }

        Ok(())
    }
}
