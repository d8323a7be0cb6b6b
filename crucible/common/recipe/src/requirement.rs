// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt::Display;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use version::{Version, VersionSpec};

use crate::DependencyExpr;

/// A valid package or virtual name. Shared-library virtuals like
/// `libfoo.so.6` are names too.
static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._+-]*").unwrap());

/// One acceptable provider of a requirement: a (possibly virtual) name plus
/// an optional version constraint.
#[derive(Clone, Debug)]
pub struct NameSpec {
    pub name: String,
    pub spec: Option<VersionSpec>,
}

impl NameSpec {
    /// Parses `zlib`, `zlib>=1.2,<2.0` or `zlib >=1.2`.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let Some(m) = NAME_RE.find(input) else {
            bail!("invalid requirement {input:?}");
        };
        let name = m.as_str().to_string();
        let rest = input[m.end()..].trim();
        let spec = if rest.is_empty() {
            None
        } else {
            Some(VersionSpec::try_new(rest)?)
        };
        Ok(Self { name, spec })
    }

    /// Checks a concrete version against the constraint (no constraint
    /// accepts anything).
    pub fn accepts(&self, version: &Version) -> bool {
        match &self.spec {
            Some(spec) => spec.matches(version),
            None => true,
        }
    }
}

impl Display for NameSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.spec {
            Some(spec) => write!(f, "{}{}", self.name, spec),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A lowered dependency edge: an ordered list of acceptable providers, any
/// of which satisfies the edge.
#[derive(Clone, Debug)]
pub struct Requirement {
    choices: Vec<NameSpec>,
    optional: bool,
    raw: String,
}

impl Requirement {
    /// Parses a plain requirement string into a single-choice edge.
    pub fn parse(input: &str) -> Result<Self> {
        let choice = NameSpec::parse(input)?;
        Ok(Self {
            raw: choice.to_string(),
            choices: vec![choice],
            optional: false,
        })
    }

    pub(crate) fn from_expr(expr: &DependencyExpr, optional: bool) -> Result<Self> {
        match expr {
            DependencyExpr::Spec(text) => {
                let mut requirement = Self::parse(text)?;
                requirement.optional = optional;
                Ok(requirement)
            }
            DependencyExpr::Record {
                name,
                version,
                optional: record_optional,
            } => {
                let spec = match version {
                    Some(text) => Some(VersionSpec::try_new(text)?),
                    None => None,
                };
                let choice = NameSpec {
                    name: name.clone(),
                    spec,
                };
                Ok(Self {
                    raw: choice.to_string(),
                    choices: vec![choice],
                    optional: optional || *record_optional,
                })
            }
            DependencyExpr::Alternatives(items) => {
                if items.is_empty() {
                    bail!("empty dependency alternative list");
                }
                let mut choices = Vec::new();
                for item in items {
                    choices.extend(Self::from_expr(item, optional)?.choices);
                }
                let raw = choices
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(" | ");
                Ok(Self {
                    choices,
                    optional,
                    raw,
                })
            }
        }
    }

    /// The primary name, used for diagnostics and keying.
    pub fn name(&self) -> &str {
        &self.choices[0].name
    }

    /// The primary version constraint.
    pub fn spec(&self) -> Option<&VersionSpec> {
        self.choices[0].spec.as_ref()
    }

    pub fn choices(&self) -> &[NameSpec] {
        &self.choices
    }

    pub fn optional(&self) -> bool {
        self.optional
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Returns a copy of the edge marked optional.
    pub fn as_optional(&self) -> Self {
        Self {
            optional: true,
            ..self.clone()
        }
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}
