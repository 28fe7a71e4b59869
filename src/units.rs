//! Engineering-notation values as they appear in netlists.
//!
//! Values support the suffixes T, G, MEG, K, M, U (or µ), N, P, F
//! (case-insensitive). Any unit letters after the suffix are ignored, so
//! `10kOhm`, `100nF` and `1.5V` all parse.

use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_while};
use nom::combinator::{map, opt};
use nom::number::complete::double;
use nom::IResult;
use nom::Parser;

use crate::error::{Result, SpiceBatchError};

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a numeric value with optional engineering suffix.
/// Handles: 10k, 100n, 4.7u, 1MEG, 1e3, -3.3, etc.
pub(crate) fn eng_value(input: &str) -> IResult<&str, f64> {
    let (rest, num) = double(input)?;
    let (rest, suffix) = opt(eng_suffix).parse(rest)?;
    let multiplier = suffix.unwrap_or(1.0);
    Ok((rest, num * multiplier))
}

/// Match an engineering suffix and return its multiplier.
fn eng_suffix(input: &str) -> IResult<&str, f64> {
    // Order matters: MEG must come before M
    alt((
        map(tag_no_case("MEG"), |_: &str| 1e6),
        map(tag_no_case("T"), |_: &str| 1e12),
        map(tag_no_case("G"), |_: &str| 1e9),
        map(tag_no_case("K"), |_: &str| 1e3),
        map(tag_no_case("M"), |_: &str| 1e-3),
        map(tag_no_case("U"), |_: &str| 1e-6),
        map(tag("µ"), |_: &str| 1e-6),
        map(tag_no_case("N"), |_: &str| 1e-9),
        map(tag_no_case("P"), |_: &str| 1e-12),
        map(tag_no_case("F"), |_: &str| 1e-15),
    ))
    .parse(input)
}

/// Trailing unit letters (`Ohm`, `F`, `V`, `Hz`).
fn unit_letters(input: &str) -> IResult<&str, &str> {
    take_while(|c: char| c.is_alphabetic())(input)
}

/// Parse a complete engineering value, ignoring trailing unit letters.
///
/// Fails with [`SpiceBatchError::InvalidValue`] when the text is not a
/// number or has anything other than letters after it.
pub fn parse_eng(text: &str) -> Result<f64> {
    let trimmed = text.trim();
    let parsed = (eng_value, unit_letters).parse(trimmed);
    match parsed {
        Ok(("", (value, _))) => Ok(value),
        _ => Err(SpiceBatchError::InvalidValue(trimmed.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Format a value with the suffixes f, p, n, u, m, k and Meg.
///
/// Values outside 1f..1000Meg fall back to scientific notation
/// (`1.000000E+09`). Zero formats as `0.0`.
pub fn format_eng(value: f64) -> String {
    if value == 0.0 {
        return "0.0".to_string();
    }
    let mut e = (value.abs().log10() / 3.0).floor() as i32;
    // log10 rounding can land one decade off at exact powers of 1000
    let scaled = value.abs() * 1000f64.powi(-e);
    if scaled >= 1000.0 {
        e += 1;
    } else if scaled < 1.0 {
        e -= 1;
    }
    let suffix = match e {
        -5 => "f",
        -4 => "p",
        -3 => "n",
        -2 => "u",
        -1 => "m",
        0 => "",
        1 => "k",
        2 => "Meg",
        _ => return format_scientific(value),
    };
    let mantissa = value * 1000f64.powi(-e);
    format!("{}{}", format_general(mantissa), suffix)
}

/// Six significant digits, trailing zeros removed.
fn format_general(value: f64) -> String {
    let magnitude = if value == 0.0 {
        0
    } else {
        value.abs().log10().floor() as i32
    };
    let decimals = (5 - magnitude).max(0) as usize;
    let text = format!("{:.*}", decimals, value);
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

fn format_scientific(value: f64) -> String {
    let text = format!("{:.6E}", value);
    match text.split_once('E') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}E{}{:0>2}", mantissa, sign, digits)
        }
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_eng_value_plain_number() {
        let (rest, val) = eng_value("100").unwrap();
        assert_eq!(rest, "");
        assert_relative_eq!(val, 100.0);
    }

    #[test]
    fn test_eng_value_meg_before_milli() {
        let (_, meg) = eng_value("2MEG").unwrap();
        let (_, milli) = eng_value("2m").unwrap();
        assert_relative_eq!(meg, 2e6);
        assert_relative_eq!(milli, 2e-3);
    }

    #[test]
    fn test_parse_eng_ignores_units() {
        assert_relative_eq!(parse_eng("10kOhm").unwrap(), 10e3);
        assert_relative_eq!(parse_eng("100nF").unwrap(), 100e-9);
        assert_relative_eq!(parse_eng(" 1.5V ").unwrap(), 1.5);
        assert_relative_eq!(parse_eng("4.7µ").unwrap(), 4.7e-6);
    }

    #[test]
    fn test_parse_eng_rejects_garbage() {
        assert!(matches!(parse_eng("abc"), Err(SpiceBatchError::InvalidValue(_))));
        assert!(parse_eng("{rval}").is_err());
        assert!(parse_eng("10k 5").is_err());
    }

    #[test]
    fn test_format_eng_suffixes() {
        assert_eq!(format_eng(0.0), "0.0");
        assert_eq!(format_eng(4000.0), "4k");
        assert_eq!(format_eng(500.0), "500");
        assert_eq!(format_eng(4.7e-6), "4.7u");
        assert_eq!(format_eng(2.2e6), "2.2Meg");
        assert_eq!(format_eng(-15e-3), "-15m");
        assert_eq!(format_eng(1e-15), "1f");
        assert_eq!(format_eng(100e-12), "100p");
    }

    #[test]
    fn test_format_eng_scientific_fallback() {
        assert_eq!(format_eng(1e9), "1.000000E+09");
        assert_eq!(format_eng(1e-18), "1.000000E-18");
    }
}
