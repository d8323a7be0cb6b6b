// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Package version numbers and version constraint expressions.

mod parser;
mod spec;
mod version;

pub use spec::{CompareOp, VersionSpec};
pub use version::{SuffixLabel, Version};
