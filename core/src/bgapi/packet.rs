//! BGAPI binary framing for BlueGiga BLED112 dongles.
//!
//! Every packet starts with a four byte header:
//!
//! | byte | bits | meaning                                  |
//! |------|------|------------------------------------------|
//! | 0    | 7    | 0 = command/response, 1 = event          |
//! | 0    | 6..3 | technology (0 = bluetooth smart)         |
//! | 0    | 2..0 | payload length, high bits                |
//! | 1    |      | payload length, low byte                 |
//! | 2    |      | message class                            |
//! | 3    |      | message id                               |
//!
//! Multi-byte fields are little-endian, byte arrays carry a one byte length
//! prefix.

use nom::{
    bytes::complete::take,
    multi::{length_data, many0},
    number::complete::{le_i8, le_u16, le_u8},
    IResult, Parser,
};

use crate::error::BackendError;
use crate::models::{AddressType, DeviceAddress};

pub const HEADER_LEN: usize = 4;
const EVENT_FLAG: u8 = 0x80;

pub const CLASS_CONNECTION: u8 = 3;
pub const CLASS_ATTCLIENT: u8 = 4;
pub const CLASS_GAP: u8 = 6;

/// `connection_status` flag set while the link is up.
pub const FLAG_CONNECTED: u8 = 0x01;

/// `gap_discover` mode reporting every advertiser.
pub const DISCOVER_OBSERVATION: u8 = 2;

// AD structure types carrying the device name
const AD_SHORT_NAME: u8 = 0x08;
const AD_COMPLETE_NAME: u8 = 0x09;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SetScanParameters { interval: u16, window: u16, active: bool },
    Discover { mode: u8 },
    ConnectDirect {
        address: DeviceAddress,
        interval_min: u16,
        interval_max: u16,
        timeout: u16,
        latency: u16,
    },
    EndProcedure,
    Disconnect { connection: u8 },
    ReadByHandle { connection: u8, handle: u16 },
    AttributeWrite { connection: u8, handle: u16, data: Vec<u8> },
}

impl Command {
    pub fn class_id(&self) -> (u8, u8) {
        match self {
            Command::SetScanParameters { .. } => (CLASS_GAP, 7),
            Command::Discover { .. } => (CLASS_GAP, 2),
            Command::ConnectDirect { .. } => (CLASS_GAP, 3),
            Command::EndProcedure => (CLASS_GAP, 4),
            Command::Disconnect { .. } => (CLASS_CONNECTION, 0),
            Command::ReadByHandle { .. } => (CLASS_ATTCLIENT, 4),
            Command::AttributeWrite { .. } => (CLASS_ATTCLIENT, 5),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::SetScanParameters { .. } => "gap_set_scan_parameters",
            Command::Discover { .. } => "gap_discover",
            Command::ConnectDirect { .. } => "gap_connect_direct",
            Command::EndProcedure => "gap_end_procedure",
            Command::Disconnect { .. } => "connection_disconnect",
            Command::ReadByHandle { .. } => "attclient_read_by_handle",
            Command::AttributeWrite { .. } => "attclient_attribute_write",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Command::SetScanParameters {
                interval,
                window,
                active,
            } => {
                payload.extend_from_slice(&interval.to_le_bytes());
                payload.extend_from_slice(&window.to_le_bytes());
                payload.push(u8::from(*active));
            }
            Command::Discover { mode } => payload.push(*mode),
            Command::ConnectDirect {
                address,
                interval_min,
                interval_max,
                timeout,
                latency,
            } => {
                payload.extend_from_slice(&address.to_le_bytes());
                payload.push(address_type_code(address.address_type));
                for field in [interval_min, interval_max, timeout, latency] {
                    payload.extend_from_slice(&field.to_le_bytes());
                }
            }
            Command::EndProcedure => {}
            Command::Disconnect { connection } => payload.push(*connection),
            Command::ReadByHandle { connection, handle } => {
                payload.push(*connection);
                payload.extend_from_slice(&handle.to_le_bytes());
            }
            Command::AttributeWrite {
                connection,
                handle,
                data,
            } => {
                payload.push(*connection);
                payload.extend_from_slice(&handle.to_le_bytes());
                // attribute values never exceed a single ATT MTU
                payload.push(data.len().min(u8::MAX as usize) as u8);
                payload.extend_from_slice(&data[..data.len().min(u8::MAX as usize)]);
            }
        }

        let (class, id) = self.class_id();
        let len = payload.len();
        let mut frame = Vec::with_capacity(HEADER_LEN + len);
        frame.push(((len >> 8) & 0x07) as u8);
        frame.push((len & 0xff) as u8);
        frame.push(class);
        frame.push(id);
        frame.extend_from_slice(&payload);
        frame
    }
}

/// Reply to a [`Command`]. Every reply carries a result code, zero on
/// success.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub class: u8,
    pub id: u8,
    pub result: u16,
    pub connection: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    ConnectionStatus {
        connection: u8,
        flags: u8,
        address: DeviceAddress,
    },
    Disconnected {
        connection: u8,
        reason: u16,
    },
    ProcedureCompleted {
        connection: u8,
        result: u16,
        handle: u16,
    },
    AttributeValue {
        connection: u8,
        handle: u16,
        data: Vec<u8>,
    },
    ScanResponse {
        rssi: i8,
        address: DeviceAddress,
        data: Vec<u8>,
    },
    Other {
        class: u8,
        id: u8,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Response(Response),
    Event(Event),
}

/// Payload length announced by a header.
pub fn payload_len(header: &[u8]) -> Option<usize> {
    match header {
        [b0, b1, ..] => Some((((*b0 & 0x07) as usize) << 8) | *b1 as usize),
        _ => None,
    }
}

/// Decode one complete frame.
pub fn decode_packet(frame: &[u8]) -> Result<Packet, BackendError> {
    let malformed = || BackendError::ProtocolError(format!("malformed BGAPI frame {:02x?}", frame));
    let (payload, (kind, class, id)) = header(frame).map_err(|_| malformed())?;
    let is_event = kind & EVENT_FLAG != 0;

    let parsed = if is_event {
        event(class, id, payload).map(|(rest, e)| (rest, Packet::Event(e)))
    } else {
        response(class, id, payload).map(|(rest, r)| (rest, Packet::Response(r)))
    };
    parsed.map(|(_, packet)| packet).map_err(|_| malformed())
}

/// Device name advertised in the AD structures of a scan response.
pub fn advertised_name(data: &[u8]) -> Option<String> {
    let parsed: IResult<&[u8], Vec<&[u8]>> = many0(length_data(le_u8)).parse(data);
    let (_, structures) = parsed.ok()?;
    let mut short = None;
    for structure in structures {
        match structure.split_first() {
            Some((&AD_COMPLETE_NAME, name)) => {
                return Some(String::from_utf8_lossy(name).into_owned())
            }
            Some((&AD_SHORT_NAME, name)) => {
                short = Some(String::from_utf8_lossy(name).into_owned())
            }
            _ => {}
        }
    }
    short
}

/// Human readable name for the result codes seen in practice.
pub fn result_name(code: u16) -> &'static str {
    match code {
        0x0000 => "success",
        0x0180 => "invalid parameter",
        0x0181 => "device in wrong state",
        0x0182 => "out of memory",
        0x0186 => "not connected",
        0x0208 => "connection timeout",
        0x0213 => "remote user terminated connection",
        0x023e => "connection failed to be established",
        0x0401 => "invalid handle",
        0x0402 => "read not permitted",
        0x0403 => "write not permitted",
        _ => "unknown error",
    }
}

fn address_type_code(address_type: AddressType) -> u8 {
    match address_type {
        AddressType::Public => 0,
        AddressType::Random => 1,
    }
}

fn header(input: &[u8]) -> IResult<&[u8], (u8, u8, u8)> {
    let (rest, (kind, len_low, class, id)) = (le_u8, le_u8, le_u8, le_u8).parse(input)?;
    let len = (((kind & 0x07) as usize) << 8) | len_low as usize;
    // trailing bytes after the announced payload are ignored
    let (_, payload) = take(len).parse(rest)?;
    Ok((payload, (kind, class, id)))
}

fn address(input: &[u8]) -> IResult<&[u8], DeviceAddress> {
    let (rest, (raw, kind)) = (take(6usize), le_u8).parse(input)?;
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(raw);
    let address_type = if kind == 0 {
        AddressType::Public
    } else {
        AddressType::Random
    };
    Ok((rest, DeviceAddress::from_le_bytes(bytes, address_type)))
}

fn response(class: u8, id: u8, input: &[u8]) -> IResult<&[u8], Response> {
    let (rest, (result, connection)) = match (class, id) {
        // connection handle precedes the result
        (CLASS_CONNECTION, 0) | (CLASS_ATTCLIENT, 4) | (CLASS_ATTCLIENT, 5) => {
            let (rest, (connection, result)) = (le_u8, le_u16).parse(input)?;
            (rest, (result, Some(connection)))
        }
        (CLASS_GAP, 3) => {
            let (rest, (result, connection)) = (le_u16, le_u8).parse(input)?;
            (rest, (result, Some(connection)))
        }
        _ if input.len() >= 2 => {
            let (rest, result) = le_u16.parse(input)?;
            (rest, (result, None))
        }
        _ => (input, (0, None)),
    };
    Ok((
        rest,
        Response {
            class,
            id,
            result,
            connection,
        },
    ))
}

fn event(class: u8, id: u8, input: &[u8]) -> IResult<&[u8], Event> {
    match (class, id) {
        (CLASS_CONNECTION, 0) => {
            let (rest, (connection, flags, address)) = (le_u8, le_u8, address).parse(input)?;
            Ok((
                rest,
                Event::ConnectionStatus {
                    connection,
                    flags,
                    address,
                },
            ))
        }
        (CLASS_CONNECTION, 4) => {
            let (rest, (connection, reason)) = (le_u8, le_u16).parse(input)?;
            Ok((rest, Event::Disconnected { connection, reason }))
        }
        (CLASS_ATTCLIENT, 1) => {
            let (rest, (connection, result, handle)) = (le_u8, le_u16, le_u16).parse(input)?;
            Ok((
                rest,
                Event::ProcedureCompleted {
                    connection,
                    result,
                    handle,
                },
            ))
        }
        (CLASS_ATTCLIENT, 5) => {
            let (rest, (connection, handle, _kind, data)) =
                (le_u8, le_u16, le_u8, length_data(le_u8)).parse(input)?;
            Ok((
                rest,
                Event::AttributeValue {
                    connection,
                    handle,
                    data: data.to_vec(),
                },
            ))
        }
        (CLASS_GAP, 0) => {
            let (rest, (rssi, _packet_type, address, _bond, data)) =
                (le_i8, le_u8, address, le_u8, length_data(le_u8)).parse(input)?;
            Ok((
                rest,
                Event::ScanResponse {
                    rssi,
                    address,
                    data: data.to_vec(),
                },
            ))
        }
        _ => Ok((input, Event::Other { class, id })),
    }
}

/// Splits a byte stream into whole frames.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete frame, if one has been buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let len = payload_len(&self.buffer)?;
        if self.buffer.len() < HEADER_LEN + len {
            return None;
        }
        let rest = self.buffer.split_off(HEADER_LEN + len);
        Some(std::mem::replace(&mut self.buffer, rest))
    }
}
