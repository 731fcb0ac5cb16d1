// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod backends;
pub mod decoder;
pub mod dpb;
pub mod headers;
mod marking;
mod output;
pub mod picture;
mod poc;
mod ref_lists;
pub mod sequence;
