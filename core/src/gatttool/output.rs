//! Parsers for the text `gatttool` and `hcitool` print.

use nom::{
    bytes::complete::{tag, take_until, take_while1, take_while_m_n},
    character::complete::{char, space1},
    combinator::map_res,
    multi::{many1, separated_list1},
    sequence::preceded,
    IResult, Parser,
};
use tracing::warn;

use crate::models::{DeviceAddress, DiscoveredDevice, Handle};

pub const SUCCESS_MARKER: &str = "successfully";
pub const WRITE_FAILED_MARKER: &str = "Write Request failed";
pub const READ_FAILED_MARKER: &str = "read failed";

/// Uppercase hex without separators, the form `gatttool -n` expects.
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Bytes of the first run of space separated two digit hex groups.
///
/// `Characteristic value/descriptor: 4d 4a 5f 48` yields `[0x4d, 0x4a, 0x5f, 0x48]`.
pub fn find_hex_bytes(text: &str) -> Option<Vec<u8>> {
    text.char_indices()
        .filter(|(_, c)| *c == ' ')
        .find_map(|(i, _)| spaced_bytes(&text[i..]).ok().map(|(_, bytes)| bytes))
}

/// One frame received in listen mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationLine {
    pub handle: Option<Handle>,
    pub data: Vec<u8>,
}

/// Extract the notification frames from listen-mode output.
///
/// The first line is the write status and is skipped. Every following
/// `<label>: <hex bytes>` line is one frame, kept in output order.
pub fn notification_lines(output: &str) -> Vec<NotificationLine> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split(": ");
            let (label, data) = (parts.next()?, parts.next()?);
            if parts.next().is_some() {
                return None;
            }
            match hex_list(data.trim()) {
                Ok(("", data)) => Some(NotificationLine {
                    handle: label_handle(label),
                    data,
                }),
                _ => {
                    warn!(line, "ignoring malformed notification line");
                    None
                }
            }
        })
        .collect()
}

/// Devices printed by `hcitool lescan`, one per address.
///
/// A later line with a real name replaces an earlier `(unknown)`.
pub fn scan_results(output: &str) -> Vec<DiscoveredDevice> {
    let mut devices: Vec<DiscoveredDevice> = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        let (address, name) = line.split_once(' ').unwrap_or((line, ""));
        let Ok(address) = address.parse::<DeviceAddress>() else {
            continue;
        };
        let name = match name.trim() {
            "" | "(unknown)" => None,
            name => Some(name.to_string()),
        };
        match devices.iter_mut().find(|d| d.address == address) {
            Some(known) => {
                if known.name.is_none() {
                    known.name = name;
                }
            }
            None => devices.push(DiscoveredDevice { address, name }),
        }
    }
    devices
}

fn hex_byte(input: &str) -> IResult<&str, u8> {
    map_res(
        take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        |s: &str| u8::from_str_radix(s, 16),
    )
    .parse(input)
}

fn spaced_bytes(input: &str) -> IResult<&str, Vec<u8>> {
    many1(preceded(char(' '), hex_byte)).parse(input)
}

fn hex_list(input: &str) -> IResult<&str, Vec<u8>> {
    separated_list1(space1, hex_byte).parse(input)
}

fn label_handle(label: &str) -> Option<Handle> {
    let parsed: IResult<&str, u16> = preceded(
        (take_until("handle = 0x"), tag("handle = 0x")),
        map_res(take_while1(|c: char| c.is_ascii_hexdigit()), |s: &str| {
            u16::from_str_radix(s, 16)
        }),
    )
    .parse(label);
    parsed.ok().map(|(_, handle)| Handle(handle))
}
