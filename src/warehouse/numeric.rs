//! Binary NUMERIC codec
//!
//! PostgreSQL (and Redshift) send NUMERIC in binary as base-10000 digit
//! groups with a weight, sign and display scale:
//!
//! ```text
//! ndigits: i16 | weight: i16 | sign: u16 | dscale: u16 | digits: [i16; ndigits]
//! ```
//!
//! Values are converted to and from their exact decimal text so no precision
//! is lost on the way through.

use bytes::{BufMut, BytesMut};
use std::fmt::Write as _;
use thiserror::Error;

const SIGN_POS: u16 = 0x0000;
const SIGN_NEG: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;
const SIGN_PINF: u16 = 0xD000;
const SIGN_NINF: u16 = 0xF000;

const NBASE: u16 = 10_000;
const MAX_DSCALE: usize = 0x3FFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NumericError {
    #[error("numeric value truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid numeric sign 0x{0:04x}")]
    InvalidSign(u16),

    #[error("invalid numeric digit {0}")]
    InvalidDigit(i16),

    #[error("'{0}' is not a decimal literal")]
    InvalidLiteral(String),

    #[error("decimal literal too large")]
    Overflow,
}

/// Decode a binary NUMERIC into exact decimal text
pub fn decode(raw: &[u8]) -> Result<String, NumericError> {
    if raw.len() < 8 {
        return Err(NumericError::Truncated {
            expected: 8,
            actual: raw.len(),
        });
    }
    let read_i16 = |at: usize| i16::from_be_bytes([raw[at], raw[at + 1]]);
    let ndigits = read_i16(0).max(0) as usize;
    let weight = read_i16(2) as i32;
    let sign = u16::from_be_bytes([raw[4], raw[5]]);
    let dscale = u16::from_be_bytes([raw[6], raw[7]]) as usize;

    let expected = 8 + ndigits * 2;
    if raw.len() != expected {
        return Err(NumericError::Truncated {
            expected,
            actual: raw.len(),
        });
    }

    let negative = match sign {
        SIGN_POS => false,
        SIGN_NEG => true,
        SIGN_NAN => return Ok("NaN".to_string()),
        SIGN_PINF => return Ok("Infinity".to_string()),
        SIGN_NINF => return Ok("-Infinity".to_string()),
        other => return Err(NumericError::InvalidSign(other)),
    };

    let mut digits = Vec::with_capacity(ndigits);
    for i in 0..ndigits {
        let digit = read_i16(8 + i * 2);
        if !(0..NBASE as i16).contains(&digit) {
            return Err(NumericError::InvalidDigit(digit));
        }
        digits.push(digit as u16);
    }
    let group = |index: i32| -> u16 {
        if index < 0 {
            0
        } else {
            digits.get(index as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for index in 0..=weight {
            if index == 0 {
                let _ = write!(out, "{}", group(index));
            } else {
                let _ = write!(out, "{:04}", group(index));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut index = weight + 1;
        while fraction.len() < dscale {
            let _ = write!(fraction, "{:04}", group(index));
            index += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}

struct Literal<'a> {
    negative: bool,
    integer: &'a str,
    fraction: &'a str,
}

fn parse_literal(text: &str) -> Option<Literal<'_>> {
    let (negative, body) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let (integer, fraction) = match body.split_once('.') {
        Some((integer, fraction)) => (integer, fraction),
        None => (body, ""),
    };
    if integer.is_empty() && fraction.is_empty() {
        return None;
    }
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(integer) || !all_digits(fraction) {
        return None;
    }
    Some(Literal {
        negative,
        integer: integer.trim_start_matches('0'),
        fraction,
    })
}

fn special_sign(text: &str) -> Option<u16> {
    match text.to_ascii_lowercase().as_str() {
        "nan" => Some(SIGN_NAN),
        "infinity" | "+infinity" => Some(SIGN_PINF),
        "-infinity" => Some(SIGN_NINF),
        _ => None,
    }
}

/// Whether `text` is a plain decimal literal (`-12.50`, `.5`, `7`, `NaN`)
pub fn is_decimal_literal(text: &str) -> bool {
    special_sign(text).is_some() || parse_literal(text).is_some()
}

/// Encode exact decimal text as a binary NUMERIC
pub fn encode(text: &str, out: &mut BytesMut) -> Result<(), NumericError> {
    if let Some(sign) = special_sign(text) {
        out.put_i16(0);
        out.put_i16(0);
        out.put_u16(sign);
        out.put_u16(0);
        return Ok(());
    }

    let literal =
        parse_literal(text).ok_or_else(|| NumericError::InvalidLiteral(text.to_string()))?;
    let dscale = literal.fraction.len();
    if dscale > MAX_DSCALE {
        return Err(NumericError::Overflow);
    }

    let int_pad = (4 - literal.integer.len() % 4) % 4;
    let frac_pad = (4 - literal.fraction.len() % 4) % 4;
    let mut padded = String::with_capacity(int_pad + literal.integer.len() + dscale + frac_pad);
    padded.extend(std::iter::repeat('0').take(int_pad));
    padded.push_str(literal.integer);
    padded.push_str(literal.fraction);
    padded.extend(std::iter::repeat('0').take(frac_pad));

    let mut groups: Vec<u16> = padded
        .as_bytes()
        .chunks(4)
        .map(|chunk| chunk.iter().fold(0u16, |acc, b| acc * 10 + (b - b'0') as u16))
        .collect();

    let int_groups = (int_pad + literal.integer.len()) / 4;
    let mut weight = int_groups as i32 - 1;

    let leading = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading);
    weight -= leading as i32;
    while groups.last() == Some(&0) {
        groups.pop();
    }

    let (sign, weight) = if groups.is_empty() {
        (SIGN_POS, 0)
    } else if literal.negative {
        (SIGN_NEG, weight)
    } else {
        (SIGN_POS, weight)
    };

    let ndigits = i16::try_from(groups.len()).map_err(|_| NumericError::Overflow)?;
    let weight = i16::try_from(weight).map_err(|_| NumericError::Overflow)?;

    out.reserve(8 + groups.len() * 2);
    out.put_i16(ndigits);
    out.put_i16(weight);
    out.put_u16(sign);
    out.put_u16(dscale as u16);
    for digit in groups {
        out.put_i16(digit as i16);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn round_trip(text: &str) -> String {
        let mut buf = BytesMut::new();
        encode(text, &mut buf).unwrap();
        decode(&buf).unwrap()
    }

    #[test]
    fn test_known_encoding() {
        let mut buf = BytesMut::new();
        encode("12345.6789", &mut buf).unwrap();
        // ndigits=3 weight=1 sign=+ dscale=4 digits=[1, 2345, 6789]
        assert_eq!(
            &buf[..],
            &[0, 3, 0, 1, 0, 0, 0, 4, 0, 1, 0x09, 0x29, 0x1a, 0x85]
        );
    }

    #[test]
    fn test_exact_round_trips() {
        assert_eq!(round_trip("12345.6789"), "12345.6789");
        assert_eq!(round_trip("0.0001"), "0.0001");
        assert_eq!(round_trip("0.00001"), "0.00001");
        assert_eq!(round_trip("-42"), "-42");
        assert_eq!(round_trip("1.10"), "1.10");
        assert_eq!(round_trip("100000000"), "100000000");
        assert_eq!(round_trip("007.50"), "7.50");
        assert_eq!(round_trip(".5"), "0.5");
    }

    #[test]
    fn test_zero_drops_sign() {
        assert_eq!(round_trip("-0.00"), "0.00");
        assert_eq!(round_trip("0"), "0");
    }

    #[test]
    fn test_special_values() {
        assert_eq!(round_trip("NaN"), "NaN");
        assert_eq!(round_trip("Infinity"), "Infinity");
        assert_eq!(round_trip("-Infinity"), "-Infinity");
    }

    #[test]
    fn test_decode_respects_dscale_beyond_digits() {
        // 1.5 stored with dscale 3
        let raw = [0, 2, 0, 0, 0, 0, 0, 3, 0, 1, 0x13, 0x88];
        assert_eq!(decode(&raw).unwrap(), "1.500");
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert!(matches!(decode(&[0, 1]), Err(NumericError::Truncated { .. })));
        assert!(matches!(
            decode(&[0, 2, 0, 0, 0, 0, 0, 0, 0, 1]),
            Err(NumericError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_bad_sign() {
        let raw = [0, 0, 0, 0, 0x12, 0x34, 0, 0];
        assert_eq!(decode(&raw), Err(NumericError::InvalidSign(0x1234)));
    }

    #[test]
    fn test_literal_validation() {
        assert!(is_decimal_literal("12345.6789"));
        assert!(is_decimal_literal("-1"));
        assert!(is_decimal_literal("+.25"));
        assert!(is_decimal_literal("nan"));
        assert!(!is_decimal_literal(""));
        assert!(!is_decimal_literal("-"));
        assert!(!is_decimal_literal("."));
        assert!(!is_decimal_literal("1e5"));
        assert!(!is_decimal_literal("1,000"));
    }

    #[quickcheck]
    fn prop_decimal_text_survives_round_trip(negative: bool, integer: u64, fraction: Vec<u8>) -> bool {
        let fraction: String = fraction
            .iter()
            .take(40)
            .map(|d| char::from(b'0' + d % 10))
            .collect();
        let mut text = String::new();
        let is_zero = integer == 0 && fraction.bytes().all(|b| b == b'0');
        if negative && !is_zero {
            text.push('-');
        }
        text.push_str(&integer.to_string());
        if !fraction.is_empty() {
            text.push('.');
            text.push_str(&fraction);
        }
        round_trip(&text) == text
    }
}
