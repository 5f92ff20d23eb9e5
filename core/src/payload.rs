//! Decoding of the sensor's notification and attribute payloads.
//!
//! The sensor pushes a short ASCII frame such as `T=25.6 H=23.6` followed by
//! a NUL or some other trailing byte. Battery level, name and firmware are
//! read from their own handles and only need trivial conversions.

use nom::{
    bytes::complete::tag,
    character::complete::{char, digit1},
    combinator::{map_res, opt, recognize},
    IResult, Parser,
};

use crate::error::BackendError;
use crate::models::SensorReading;

/// Decode a temperature/humidity frame.
///
/// Invalid UTF-8 is replaced rather than rejected and surrounding whitespace
/// and NUL bytes are ignored. Anything after the humidity field is ignored.
pub fn decode_reading(raw: &[u8]) -> Result<SensorReading, BackendError> {
    let text = decode_text(raw);
    let start = text
        .find("T=")
        .ok_or_else(|| BackendError::Decode(format!("no temperature field in '{}'", text)))?;

    match parse_frame(&text[start..]) {
        Ok((_, reading)) => Ok(reading),
        Err(e) => Err(BackendError::Decode(format!(
            "malformed frame '{}': {:?}",
            text, e
        ))),
    }
}

/// Lossy text conversion used for the name and firmware handles.
pub fn decode_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}

/// Battery level in percent, stored in the first byte of its handle.
pub fn decode_battery(raw: &[u8]) -> Result<u8, BackendError> {
    raw.first()
        .copied()
        .ok_or_else(|| BackendError::Decode("empty battery payload".to_string()))
}

fn parse_frame(input: &str) -> IResult<&str, SensorReading> {
    let (input, (_, temperature, _, _, humidity)) = (
        tag("T="),
        signed_decimal,
        char(' '),
        tag("H="),
        unsigned_decimal,
    )
        .parse(input)?;
    Ok((
        input,
        SensorReading {
            temperature,
            humidity,
        },
    ))
}

fn signed_decimal(input: &str) -> IResult<&str, f64> {
    map_res(recognize((opt(char('-')), unsigned_number)), |s: &str| {
        s.parse::<f64>()
    })
    .parse(input)
}

fn unsigned_decimal(input: &str) -> IResult<&str, f64> {
    map_res(recognize(unsigned_number), |s: &str| s.parse::<f64>()).parse(input)
}

fn unsigned_number(input: &str) -> IResult<&str, &str> {
    recognize((digit1, opt((char('.'), digit1)))).parse(input)
}
