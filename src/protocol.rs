//! S20 wire protocol implementation.
//! Fixed-layout frame encoding and decoding for the six command types.
//!
//! Every frame starts with the magic prefix `68 64` followed by a 4-byte
//! command code whose first two bytes are the total frame length:
//!
//! | Frame              | Code          | Fields                                       |
//! |--------------------|---------------|----------------------------------------------|
//! | discovery request  | `00 06 71 61` | none                                         |
//! | discovery response | `00 2a 71 61` | MAC @[7:13], reversed MAC @[19:25]            |
//! | subscribe request  | `00 1e 63 6c` | MAC @[6:12], reversed MAC @[18:24], padding   |
//! | subscribe response | `00 18 63 6c` | MAC @[6:12], state @[23]                      |
//! | control request    | `00 17 64 63` | MAC @[6:12], padding, state @[22]             |
//! | control response   | `00 17 73 66` | MAC @[6:12], state @[22]                      |
//!
//! Decoding never fails loudly: anything with the wrong magic, the wrong
//! command or too few bytes is simply "not this frame".

use crate::error::{OrviboError, Result};
use byteorder::{BigEndian, ByteOrder};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// S20 UDP port, used for both sending and receiving.
pub const PORT: u16 = 10000;

pub const MAGIC: u16 = 0x6864;
pub const HEADER_LEN: usize = 6;

pub const ON: u8 = 0x01;
pub const OFF: u8 = 0x00;

/// Six ASCII spaces.
pub const PADDING_1: [u8; 6] = [0x20; 6];
/// Four zero bytes.
pub const PADDING_2: [u8; 4] = [0x00; 4];

const MAC_LEN: usize = 6;
const MAC_AT: usize = 6;
const DISCOVERY_MAC_AT: usize = 7;
const DISCOVERY_MAC_REVERSED_AT: usize = 19;
const SUBSCRIBE_MAC_REVERSED_AT: usize = 18;
const SUBSCRIBE_STATE_AT: usize = 23;
const CONTROL_STATE_AT: usize = 22;

define_commands! {
    /// Broadcast probe; every plug on the segment answers.
    Discovery = [0x00, 0x06, 0x71, 0x61],
    DiscoveryResponse = [0x00, 0x2a, 0x71, 0x61],
    /// Reports state and authorizes control requests for a while.
    Subscribe = [0x00, 0x1e, 0x63, 0x6c],
    SubscribeResponse = [0x00, 0x18, 0x63, 0x6c],
    Control = [0x00, 0x17, 0x64, 0x63],
    /// Acknowledges a control request; also pushed when the plug is toggled locally.
    ControlResponse = [0x00, 0x17, 0x73, 0x66],
}

impl Command {
    /// Bytes a datagram must have before this command's fields can be read.
    fn required_len(self) -> usize {
        match self {
            Command::Discovery => HEADER_LEN,
            Command::DiscoveryResponse => DISCOVERY_MAC_REVERSED_AT + MAC_LEN,
            Command::Subscribe => SUBSCRIBE_MAC_REVERSED_AT + MAC_LEN,
            Command::SubscribeResponse => SUBSCRIBE_STATE_AT + 1,
            Command::Control | Command::ControlResponse => CONTROL_STATE_AT + 1,
        }
    }
}

/// Hardware address of a plug.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress([u8; MAC_LEN]);

impl MacAddress {
    pub const fn new(bytes: [u8; MAC_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; MAC_LEN] {
        &self.0
    }

    /// The byte-reversed address, as carried in subscribe requests.
    pub fn reversed(&self) -> Self {
        let mut bytes = self.0;
        bytes.reverse();
        Self(bytes)
    }

    fn read(data: &[u8], at: usize) -> Option<Self> {
        let bytes = data.get(at..at + MAC_LEN)?;
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(bytes);
        Some(Self(mac))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

impl FromStr for MacAddress {
    type Err = OrviboError;

    /// Accepts `ACCF23A1B2C3`, `ac:cf:23:a1:b2:c3` or `AC-CF-23-A1-B2-C3`.
    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes = hex::decode(&digits).map_err(|_| OrviboError::InvalidMac(s.to_string()))?;
        let mac: [u8; MAC_LEN] = bytes
            .try_into()
            .map_err(|_| OrviboError::InvalidMac(s.to_string()))?;
        Ok(Self(mac))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A decoded S20 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    DiscoveryRequest,
    DiscoveryResponse {
        mac: MacAddress,
        mac_reversed: MacAddress,
    },
    SubscribeRequest {
        mac: MacAddress,
        mac_reversed: MacAddress,
    },
    SubscribeResponse {
        mac: MacAddress,
        on: bool,
    },
    ControlRequest {
        mac: MacAddress,
        on: bool,
    },
    ControlResponse {
        mac: MacAddress,
        on: bool,
    },
}

impl Frame {
    pub fn command(&self) -> Command {
        match self {
            Frame::DiscoveryRequest => Command::Discovery,
            Frame::DiscoveryResponse { .. } => Command::DiscoveryResponse,
            Frame::SubscribeRequest { .. } => Command::Subscribe,
            Frame::SubscribeResponse { .. } => Command::SubscribeResponse,
            Frame::ControlRequest { .. } => Command::Control,
            Frame::ControlResponse { .. } => Command::ControlResponse,
        }
    }

    /// Pack the frame into its fixed-length wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let cmd = self.command();
        let mut data = vec![0u8; cmd.frame_len()];
        BigEndian::write_u16(&mut data[0..2], MAGIC);
        BigEndian::write_u32(&mut data[2..HEADER_LEN], cmd.code());

        match *self {
            Frame::DiscoveryRequest => {}
            Frame::DiscoveryResponse { mac, mac_reversed } => {
                put(&mut data, DISCOVERY_MAC_AT, mac.as_bytes());
                put(&mut data, DISCOVERY_MAC_AT + MAC_LEN, &PADDING_1);
                put(&mut data, DISCOVERY_MAC_REVERSED_AT, mac_reversed.as_bytes());
                put(&mut data, DISCOVERY_MAC_REVERSED_AT + MAC_LEN, &PADDING_1);
            }
            Frame::SubscribeRequest { mac, mac_reversed } => {
                put(&mut data, MAC_AT, mac.as_bytes());
                put(&mut data, MAC_AT + MAC_LEN, &PADDING_1);
                put(&mut data, SUBSCRIBE_MAC_REVERSED_AT, mac_reversed.as_bytes());
                put(&mut data, SUBSCRIBE_MAC_REVERSED_AT + MAC_LEN, &PADDING_1);
            }
            Frame::SubscribeResponse { mac, on } => {
                put(&mut data, MAC_AT, mac.as_bytes());
                put(&mut data, MAC_AT + MAC_LEN, &PADDING_1);
                data[SUBSCRIBE_STATE_AT] = state_byte(on);
            }
            Frame::ControlRequest { mac, on } | Frame::ControlResponse { mac, on } => {
                put(&mut data, MAC_AT, mac.as_bytes());
                put(&mut data, MAC_AT + MAC_LEN, &PADDING_1);
                put(&mut data, MAC_AT + 2 * MAC_LEN, &PADDING_2);
                data[CONTROL_STATE_AT] = state_byte(on);
            }
        }

        data
    }

    /// Decode `data` as a frame of the `expected` command.
    ///
    /// Returns `None` unless `data[0:6]` is the magic prefix followed by the
    /// expected code and the datagram is long enough for that frame's fields.
    pub fn decode(data: &[u8], expected: Command) -> Option<Frame> {
        if !header_matches(data, expected) || data.len() < expected.required_len() {
            return None;
        }

        let frame = match expected {
            Command::Discovery => Frame::DiscoveryRequest,
            Command::DiscoveryResponse => Frame::DiscoveryResponse {
                mac: MacAddress::read(data, DISCOVERY_MAC_AT)?,
                mac_reversed: MacAddress::read(data, DISCOVERY_MAC_REVERSED_AT)?,
            },
            Command::Subscribe => Frame::SubscribeRequest {
                mac: MacAddress::read(data, MAC_AT)?,
                mac_reversed: MacAddress::read(data, SUBSCRIBE_MAC_REVERSED_AT)?,
            },
            // Anything other than the ON byte reads as off.
            Command::SubscribeResponse => Frame::SubscribeResponse {
                mac: MacAddress::read(data, MAC_AT)?,
                on: data[SUBSCRIBE_STATE_AT] == ON,
            },
            // Control state must be exactly ON or OFF so acks can match the request byte.
            Command::Control => Frame::ControlRequest {
                mac: MacAddress::read(data, MAC_AT)?,
                on: strict_state(data[CONTROL_STATE_AT])?,
            },
            Command::ControlResponse => Frame::ControlResponse {
                mac: MacAddress::read(data, MAC_AT)?,
                on: strict_state(data[CONTROL_STATE_AT])?,
            },
        };
        Some(frame)
    }

    /// Decode `data` as whichever command its header names.
    pub fn parse(data: &[u8]) -> Option<Frame> {
        if data.len() < HEADER_LEN || BigEndian::read_u16(&data[0..2]) != MAGIC {
            return None;
        }
        let cmd = Command::from_code(BigEndian::read_u32(&data[2..HEADER_LEN]))?;
        Self::decode(data, cmd)
    }
}

/// Whether `data` starts with the magic prefix and `cmd`'s code.
pub fn header_matches(data: &[u8], cmd: Command) -> bool {
    data.len() >= HEADER_LEN
        && BigEndian::read_u16(&data[0..2]) == MAGIC
        && BigEndian::read_u32(&data[2..HEADER_LEN]) == cmd.code()
}

pub fn encode_discovery_request() -> Vec<u8> {
    Frame::DiscoveryRequest.encode()
}

pub fn encode_subscribe_request(mac: &MacAddress, mac_reversed: &MacAddress) -> Vec<u8> {
    Frame::SubscribeRequest {
        mac: *mac,
        mac_reversed: *mac_reversed,
    }
    .encode()
}

pub fn encode_control_request(mac: &MacAddress, on: bool) -> Vec<u8> {
    Frame::ControlRequest { mac: *mac, on }.encode()
}

fn put(data: &mut [u8], at: usize, bytes: &[u8]) {
    data[at..at + bytes.len()].copy_from_slice(bytes);
}

fn state_byte(on: bool) -> u8 {
    if on { ON } else { OFF }
}

fn strict_state(byte: u8) -> Option<bool> {
    match byte {
        ON => Some(true),
        OFF => Some(false),
        _ => None,
    }
}
