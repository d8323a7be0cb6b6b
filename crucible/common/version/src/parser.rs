// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1, multispace0, one_of},
    combinator::{all_consuming, map_res, opt, value},
    multi::separated_list1,
    sequence::{delimited, separated_pair},
    Finish, IResult,
};

use crate::spec::CompareOp;
use crate::version::SuffixLabel;

type ParsedVersion = (Vec<u64>, Option<(SuffixLabel, u64)>);

fn number(input: &str) -> IResult<&str, u64> {
    map_res(digit1, |s: &str| s.parse::<u64>())(input)
}

fn suffix(input: &str) -> IResult<&str, (SuffixLabel, u64)> {
    let (input, _) = opt(one_of("._-"))(input)?;
    let (input, label) = alt((
        value(SuffixLabel::Alpha, tag("alpha")),
        value(SuffixLabel::Beta, tag("beta")),
        value(SuffixLabel::Pre, tag("pre")),
        value(SuffixLabel::Rc, tag("rc")),
    ))(input)?;
    let (input, n) = opt(number)(input)?;
    Ok((input, (label, n.unwrap_or(0))))
}

fn version(input: &str) -> IResult<&str, ParsedVersion> {
    let (input, main) = separated_list1(char('.'), number)(input)?;
    let (input, suffix) = opt(suffix)(input)?;
    Ok((input, (main, suffix)))
}

/// Parses a whole string as a version number.
pub(crate) fn parse_version(
    input: &str,
) -> Result<ParsedVersion, nom::error::Error<&str>> {
    let (_, parsed) = all_consuming(version)(input).finish()?;
    Ok(parsed)
}

fn compare_op(input: &str) -> IResult<&str, CompareOp> {
    // Two-character operators must be tried before their one-character
    // prefixes.
    alt((
        value(CompareOp::Equal, tag("==")),
        value(CompareOp::NotEqual, tag("!=")),
        value(CompareOp::GreaterEqual, tag(">=")),
        value(CompareOp::LessEqual, tag("<=")),
        value(CompareOp::Compatible, tag("~=")),
        value(CompareOp::Greater, tag(">")),
        value(CompareOp::Less, tag("<")),
    ))(input)
}

fn clause(input: &str) -> IResult<&str, (CompareOp, ParsedVersion)> {
    delimited(
        multispace0,
        separated_pair(compare_op, multispace0, version),
        multispace0,
    )(input)
}

/// Parses a comma-separated intersection of version constraints, e.g.
/// `>=1.2, <2.0`.
pub(crate) fn parse_spec(
    input: &str,
) -> Result<Vec<(CompareOp, ParsedVersion)>, nom::error::Error<&str>> {
    let (_, clauses) = all_consuming(separated_list1(char(','), clause))(input).finish()?;
    Ok(clauses)
}
