//! `.options` block parser.
//!
//! Solver settings arrive as SPICE-style option lines grouped into named
//! blocks:
//!
//! ```text
//! * comment line
//! .options NONLIN MAXSTEP=40 RHSTOL=1u
//! .options NONLIN-TWOLEVEL ALGORITHM=3 CONPARAM=VS
//! + CONPARAM=D1:BETA VOLTLIMTOL=1e-6
//! ```
//!
//! Tags are case-insensitive and stored upper-case. Values are numbers with
//! optional engineering suffixes (T, G, MEG, K, M, U, N, P, F) or bare
//! strings. A repeated tag keeps every occurrence in order.

use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_while1};
use nom::character::complete::{space0, space1};
use nom::combinator::{eof, map, opt, peek};
use nom::multi::many0;
use nom::number::complete::double;
use nom::sequence::{preceded, terminated};
use nom::IResult;
use nom::Parser;

use crate::error::{Result, TwoLevelError};

/// A single option value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

/// One `TAG=VALUE` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub tag: String,
    pub value: ParamValue,
}

impl Param {
    pub fn new(tag: &str, value: ParamValue) -> Self {
        Self {
            tag: tag.to_ascii_uppercase(),
            value,
        }
    }

    pub fn number(tag: &str, value: f64) -> Self {
        Self::new(tag, ParamValue::Number(value))
    }

    pub fn text(tag: &str, value: &str) -> Self {
        Self::new(tag, ParamValue::Text(value.to_string()))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match &self.value {
            ParamValue::Number(v) => Some(*v),
            ParamValue::Text(_) => None,
        }
    }

    /// Integer view; fractional values are rejected.
    pub fn as_int(&self) -> Option<i64> {
        self.as_f64()
            .filter(|v| v.fract() == 0.0 && v.is_finite())
            .map(|v| v as i64)
    }

    /// Numbers are true when non-zero; `TRUE`/`FALSE` are accepted as text.
    pub fn as_bool(&self) -> Option<bool> {
        match &self.value {
            ParamValue::Number(v) => Some(*v != 0.0),
            ParamValue::Text(s) if s.eq_ignore_ascii_case("true") => Some(true),
            ParamValue::Text(s) if s.eq_ignore_ascii_case("false") => Some(false),
            ParamValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            ParamValue::Text(s) => Some(s),
            ParamValue::Number(_) => None,
        }
    }

    /// Read as f64 or report a configuration error naming the tag.
    pub fn expect_f64(&self) -> Result<f64> {
        self.as_f64()
            .ok_or_else(|| TwoLevelError::Config(format!("{} expects a number", self.tag)))
    }

    pub fn expect_int(&self) -> Result<i64> {
        self.as_int()
            .ok_or_else(|| TwoLevelError::Config(format!("{} expects an integer", self.tag)))
    }

    pub fn expect_bool(&self) -> Result<bool> {
        self.as_bool()
            .ok_or_else(|| TwoLevelError::Config(format!("{} expects a flag", self.tag)))
    }
}

/// A named group of parameters, e.g. `NONLIN-TWOLEVEL`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OptionBlock {
    pub name: String,
    pub params: Vec<Param>,
}

impl OptionBlock {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            params: Vec::new(),
        }
    }

    pub fn with(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn push(&mut self, param: Param) {
        self.params.push(param);
    }

    /// Last occurrence of `tag`.
    pub fn get(&self, tag: &str) -> Option<&Param> {
        self.params.iter().rev().find(|p| p.tag.eq_ignore_ascii_case(tag))
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Parse every `.options` line in `input` into blocks, in file order.
///
/// Lines that are neither `.options` nor continuations are ignored, so a
/// full netlist can be passed in.
pub fn parse(input: &str) -> Result<Vec<OptionBlock>> {
    let mut blocks: Vec<OptionBlock> = Vec::new();
    let mut continuing = false;

    for (line_num, raw_line) in input.lines().enumerate() {
        let line = raw_line.trim();

        if line.is_empty() || line.starts_with('*') {
            continue;
        }

        if line.starts_with('+') {
            if !continuing {
                continue;
            }
            let (_, params) =
                continuation_line(line).map_err(|e| parse_err(line_num, raw_line, &e))?;
            if let Some(block) = blocks.last_mut() {
                block.params.extend(params);
            }
            continue;
        }

        if line.get(..8).is_some_and(|head| head.eq_ignore_ascii_case(".options")) {
            let block = options_line(line).map_err(|e| parse_err(line_num, raw_line, &e))?;
            blocks.push(block);
            continuing = true;
        } else {
            continuing = false;
        }
    }

    Ok(blocks)
}

fn parse_err(line_num: usize, raw_line: &str, detail: &str) -> TwoLevelError {
    TwoLevelError::Parse(format!("line {}: {} in: {}", line_num + 1, detail, raw_line))
}

// ---------------------------------------------------------------------------
// Line parsers
// ---------------------------------------------------------------------------

fn options_line(line: &str) -> std::result::Result<OptionBlock, String> {
    let (_, (_, _, name, params, _, _)) = (
        tag_no_case(".options"),
        space1,
        block_name,
        many0(preceded(space1, param)),
        space0,
        eof,
    )
        .parse(line)
        .map_err(|_| "malformed .options line".to_string())?;

    let mut block = OptionBlock::new(name);
    block.params = params;
    Ok(block)
}

fn continuation_line(line: &str) -> std::result::Result<(&str, Vec<Param>), String> {
    let (rest, params) = preceded((tag("+"), space0), many0(terminated(param, space0)))
        .parse(line)
        .map_err(|_| "malformed continuation line".to_string())?;
    if !rest.is_empty() {
        return Err(format!("unexpected text '{}'", rest));
    }
    Ok((rest, params))
}

// ---------------------------------------------------------------------------
// Token parsers
// ---------------------------------------------------------------------------

fn block_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '-' || c == '_')(input)
}

/// Parameter tag, e.g. `MAXSTEP`.
fn param_tag(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

fn param(input: &str) -> IResult<&str, Param> {
    let (rest, (tag_str, _, _, _, value)) =
        (param_tag, space0, tag("="), space0, param_value).parse(input)?;
    Ok((rest, Param::new(tag_str, value)))
}

fn param_value(input: &str) -> IResult<&str, ParamValue> {
    alt((
        map(terminated(eng_value, peek(alt((space1, eof)))), ParamValue::Number),
        map(take_while1(|c: char| !c.is_whitespace()), |s: &str| {
            ParamValue::Text(s.to_string())
        }),
    ))
    .parse(input)
}

/// Parse a numeric value with optional engineering suffix.
/// Handles: 10k, 100n, 4.7u, 1MEG, 1e3, -3.3, etc.
fn eng_value(input: &str) -> IResult<&str, f64> {
    let (rest, num) = double(input)?;
    let (rest, suffix) = opt(eng_suffix).parse(rest)?;
    Ok((rest, num * suffix.unwrap_or(1.0)))
}

fn eng_suffix(input: &str) -> IResult<&str, f64> {
    // MEG before M
    alt((
        map(tag_no_case("MEG"), |_: &str| 1e6),
        map(tag_no_case("T"), |_: &str| 1e12),
        map(tag_no_case("G"), |_: &str| 1e9),
        map(tag_no_case("K"), |_: &str| 1e3),
        map(tag_no_case("M"), |_: &str| 1e-3),
        map(tag_no_case("U"), |_: &str| 1e-6),
        map(tag_no_case("N"), |_: &str| 1e-9),
        map(tag_no_case("P"), |_: &str| 1e-12),
        map(tag_no_case("F"), |_: &str| 1e-15),
    ))
    .parse(input)
}
