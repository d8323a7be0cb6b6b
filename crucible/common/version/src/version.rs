// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    cmp::Ordering,
    fmt::{Debug, Display},
    hash::{Hash, Hasher},
    str::FromStr,
};

use anyhow::{anyhow, Error, Result};
use itertools::EitherOrBoth;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::parser;

static VERSION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-[0-9]+(?:\.[0-9]+)*(?:[._-]?(?:alpha|beta|pre|rc)[0-9]*)?$").unwrap()
});

/// Pre-release labels, in ascending precedence. All of them order before the
/// plain release.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum SuffixLabel {
    Alpha,
    Beta,
    Pre,
    Rc,
}

/// A package version: dot-separated numeric components with an optional
/// pre-release suffix (`1.2.3`, `2.0_rc1`, `5.1-beta2`).
///
/// Comparison pads missing numeric components with zeros, so `1.2` and
/// `1.2.0` are equal; a pre-release orders before its release.
#[derive(Clone)]
pub struct Version {
    main: Vec<u64>,
    suffix: Option<(SuffixLabel, u64)>,
    raw: String,
}

impl Version {
    /// Parses `text` into [`Version`].
    ///
    /// [`Version`] also implements the [`FromStr`] trait, which allows you to
    /// use `str::parse` to convert [`str`] into [`Version`].
    pub fn try_new(text: &str) -> Result<Self> {
        let (main, suffix) =
            parser::parse_version(text).map_err(|e| anyhow!("invalid version {text:?}: {e}"))?;
        Ok(Self {
            main,
            suffix,
            raw: text.to_string(),
        })
    }

    /// Extracts a version suffix from `input` and returns a pair of the
    /// prefix and [`Version`].
    ///
    /// A hyphen must separate the prefix and the version suffix, e.g.
    /// `zlib-1.2.13` splits into `("zlib", 1.2.13)`.
    pub fn from_str_suffix(input: &str) -> Result<(&str, Self)> {
        let m = VERSION_SUFFIX_RE
            .find(input)
            .ok_or_else(|| anyhow!("no version suffix in {:?}", input))?;
        let version = Self::try_new(&input[m.start() + 1..])?;
        Ok((&input[..m.start()], version))
    }

    /// Returns the numeric components of the version.
    pub fn main(&self) -> &[u64] {
        &self.main
    }

    /// Returns the pre-release suffix, if any.
    pub fn suffix(&self) -> Option<(SuffixLabel, u64)> {
        self.suffix
    }

    /// Checks whether the leading numeric components match `prefix_len`
    /// components of `other`, used for compatible-release (`~=`) matching.
    pub fn shares_prefix(&self, other: &Version, prefix_len: usize) -> bool {
        (0..prefix_len).all(|i| {
            self.main.get(i).copied().unwrap_or(0) == other.main.get(i).copied().unwrap_or(0)
        })
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        for pair in self.main.iter().zip_longest(other.main.iter()) {
            let (a, b) = match pair {
                EitherOrBoth::Both(a, b) => (*a, *b),
                EitherOrBoth::Left(a) => (*a, 0),
                EitherOrBoth::Right(b) => (0, *b),
            };
            match a.cmp(&b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        // A release is newer than any of its pre-releases.
        match (&self.suffix, &other.suffix) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Trailing zero components do not affect equality, so they must not
        // affect the hash either.
        let mut main = self.main.as_slice();
        while let Some((0, rest)) = main.split_last().map(|(last, rest)| (*last, rest)) {
            if rest.is_empty() {
                break;
            }
            main = rest;
        }
        main.hash(state);
        self.suffix.hash(state);
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Version::try_new(text)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Version({})", self.raw)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Version::try_new(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ver(text: &str) -> Version {
        Version::try_new(text).unwrap()
    }

    #[test]
    fn parses_plain_versions() -> Result<()> {
        let v = ver("1.2.3");
        assert_eq!(v.main(), &[1, 2, 3]);
        assert_eq!(v.suffix(), None);
        Ok(())
    }

    #[test]
    fn parses_suffixed_versions() -> Result<()> {
        assert_eq!(ver("2.0_rc1").suffix(), Some((SuffixLabel::Rc, 1)));
        assert_eq!(ver("2.0-beta2").suffix(), Some((SuffixLabel::Beta, 2)));
        assert_eq!(ver("2.0.alpha").suffix(), Some((SuffixLabel::Alpha, 0)));
        assert_eq!(ver("3.1rc4").suffix(), Some((SuffixLabel::Rc, 4)));
        Ok(())
    }

    #[test]
    fn rejects_garbage() {
        assert!(Version::try_new("").is_err());
        assert!(Version::try_new("abc").is_err());
        assert!(Version::try_new("1.2.").is_err());
        assert!(Version::try_new("1.2.3-banana").is_err());
    }

    #[test]
    fn orders_versions() {
        assert!(ver("1.0") < ver("1.0.1"));
        assert!(ver("1.9") < ver("1.10"));
        assert!(ver("2.0_rc1") < ver("2.0"));
        assert!(ver("2.0_alpha1") < ver("2.0_beta1"));
        assert!(ver("2.0_rc1") < ver("2.0_rc2"));
        assert_eq!(ver("1.2"), ver("1.2.0"));
    }

    #[test]
    fn splits_name_and_version() -> Result<()> {
        let (name, version) = Version::from_str_suffix("linux-headers-6.1.8")?;
        assert_eq!(name, "linux-headers");
        assert_eq!(version, ver("6.1.8"));

        let (name, version) = Version::from_str_suffix("gcc-13.2.0_rc1")?;
        assert_eq!(name, "gcc");
        assert_eq!(version, ver("13.2.0_rc1"));

        assert!(Version::from_str_suffix("no-version-here-").is_err());
        Ok(())
    }

    #[test]
    fn display_round_trips_raw_text() {
        assert_eq!(ver("1.02.3").to_string(), "1.02.3");
    }
}
