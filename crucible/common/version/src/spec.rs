// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    fmt::{Debug, Display},
    str::FromStr,
};

use anyhow::{anyhow, Error, Result};

use crate::parser;
use crate::version::Version;

/// A single comparison operator of a version constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum CompareOp {
    #[strum(serialize = "==")]
    Equal,
    #[strum(serialize = "!=")]
    NotEqual,
    #[strum(serialize = ">=")]
    GreaterEqual,
    #[strum(serialize = "<=")]
    LessEqual,
    #[strum(serialize = ">")]
    Greater,
    #[strum(serialize = "<")]
    Less,
    /// Compatible release, `~=1.4.2` accepts `>=1.4.2, ==1.4.*`.
    #[strum(serialize = "~=")]
    Compatible,
}

/// An intersection of version constraints, e.g. `>=1.2, <2.0, !=1.5`.
///
/// The grammar mirrors Python version specifiers: a comma-separated list of
/// `<op><version>` clauses, all of which must hold.
#[derive(Clone)]
pub struct VersionSpec {
    clauses: Vec<(CompareOp, Version)>,
    raw: String,
}

impl VersionSpec {
    pub fn try_new(text: &str) -> Result<Self> {
        let parsed = parser::parse_spec(text)
            .map_err(|e| anyhow!("invalid version constraint {text:?}: {e}"))?;
        let clauses = parsed
            .into_iter()
            .map(|(op, (main, suffix))| {
                let rendered = render_version(&main, suffix);
                Ok((op, Version::try_new(&rendered)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            clauses,
            raw: text.trim().to_string(),
        })
    }

    /// Checks whether `version` satisfies every clause.
    pub fn matches(&self, version: &Version) -> bool {
        self.clauses.iter().all(|(op, target)| match op {
            CompareOp::Equal => version == target,
            CompareOp::NotEqual => version != target,
            CompareOp::GreaterEqual => version >= target,
            CompareOp::LessEqual => version <= target,
            CompareOp::Greater => version > target,
            CompareOp::Less => version < target,
            CompareOp::Compatible => {
                let prefix_len = target.main().len().saturating_sub(1);
                version >= target && version.shares_prefix(target, prefix_len.max(1))
            }
        })
    }

    pub fn clauses(&self) -> &[(CompareOp, Version)] {
        &self.clauses
    }
}

fn render_version(main: &[u64], suffix: Option<(crate::SuffixLabel, u64)>) -> String {
    let mut out = main
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(".");
    if let Some((label, n)) = suffix {
        out.push('_');
        out.push_str(&label.to_string());
        if n > 0 {
            out.push_str(&n.to_string());
        }
    }
    out
}

impl FromStr for VersionSpec {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        VersionSpec::try_new(text)
    }
}

impl Display for VersionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl Debug for VersionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VersionSpec({})", self.raw)
    }
}
