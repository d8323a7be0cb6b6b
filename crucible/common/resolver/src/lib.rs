// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Version-aware dependency resolution over the recipe repository.
//!
//! The solver is a backtracking DFS over package candidates, honoring
//! virtual provides, conflicts and optional edges, with deterministic
//! candidate ordering so that lockfile replays reproduce the same choice.

mod index;
mod lockfile;
mod solver;

pub use index::{Candidate, RepoIndex};
pub use lockfile::Lockfile;
pub use solver::{
    DependencyResolver, Explanation, ResolveOptions, ResolveResult,
};

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("step_limit")]
    StepLimit,
    #[error("timeout")]
    Timeout,
    #[error("resolution failed: {}", issues.join("; "))]
    Failed { issues: Vec<String> },
}
