//! Protocol commands
//!
//! Defines the messages exchanged with the motor controller and their mapping
//! onto [`Packet`] payloads.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use super::packet::{Packet, PacketBuilder};
use super::{ProtocolError, SIGNATURE};

/// Message opcodes (first payload byte)
pub mod opcode {
    /// Version query, body is the signature
    pub const HELLO: u8 = 0x01;
    /// Accept or reject the version reported by the device
    pub const VERSION_ACK: u8 = 0x02;
    /// Set motor speed
    pub const SET_SPEED: u8 = 0x10;
    /// Keep-alive
    pub const PING: u8 = 0x11;
    /// Reply to [`HELLO`]
    pub const HELLO_REPLY: u8 = 0x81;
    /// Acknowledgment of a sequenced command
    pub const ACK: u8 = 0x90;
    /// Asynchronous fault report
    pub const FAULT: u8 = 0xE0;
}

/// Commands sent to the motor controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Version query opening the handshake
    Hello,

    /// Host verdict on the reported version
    VersionAck {
        /// Whether the host will talk to this version
        accepted: bool,
    },

    /// Set the motor speed
    SetSpeed {
        /// Sequence number echoed in the acknowledgment
        seq: u8,
        /// Signed speed setpoint
        speed: i16,
    },

    /// Keep-alive sent while the link is idle
    Ping {
        /// Sequence number echoed in the acknowledgment
        seq: u8,
    },
}

impl Command {
    /// Get the opcode of this command
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Hello => opcode::HELLO,
            Command::VersionAck { .. } => opcode::VERSION_ACK,
            Command::SetSpeed { .. } => opcode::SET_SPEED,
            Command::Ping { .. } => opcode::PING,
        }
    }

    /// Sequence number carried by the command, if any
    pub fn seq(&self) -> Option<u8> {
        match self {
            Command::SetSpeed { seq, .. } | Command::Ping { seq } => Some(*seq),
            _ => None,
        }
    }

    /// Build the packet carrying this command
    pub fn to_packet(&self) -> Packet {
        let builder = PacketBuilder::new(self.opcode());
        match *self {
            Command::Hello => builder.bytes(SIGNATURE),
            Command::VersionAck { accepted } => builder.byte(if accepted { 0 } else { 1 }),
            Command::SetSpeed { seq, speed } => builder.byte(seq).i16_be(speed),
            Command::Ping { seq } => builder.byte(seq),
        }
        .build()
    }

    /// Encode the command to bytes ready for the transport
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_packet().to_bytes()
    }

    /// Parse a command from a packet (the device side of the protocol)
    pub fn from_packet(packet: &Packet) -> Result<Self, ProtocolError> {
        let payload = packet.payload.as_slice();
        match payload {
            [opcode::HELLO, sig @ ..] if sig == SIGNATURE => Ok(Command::Hello),
            [opcode::VERSION_ACK, verdict] => Ok(Command::VersionAck {
                accepted: *verdict == 0,
            }),
            [opcode::SET_SPEED, seq, speed @ ..] if speed.len() == 2 => Ok(Command::SetSpeed {
                seq: *seq,
                speed: BigEndian::read_i16(speed),
            }),
            [opcode::PING, seq] => Ok(Command::Ping { seq: *seq }),
            [opcode::HELLO | opcode::VERSION_ACK | opcode::SET_SPEED | opcode::PING, ..] | [] => {
                Err(ProtocolError::InvalidFrame)
            }
            [op, ..] => Err(ProtocolError::UnknownOpcode(*op)),
        }
    }
}

/// Messages sent by the motor controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Handshake reply
    HelloReply {
        /// Protocol version implemented by the firmware
        version: u16,
        /// Accepted speed range, reported from protocol version 2 on
        limits: Option<(i16, i16)>,
    },

    /// Acknowledgment of a sequenced command
    Ack {
        /// Sequence number of the acknowledged command
        seq: u8,
        /// 0 when the command was applied, a device status code otherwise
        status: u8,
    },

    /// Runtime fault raised by the device
    Fault {
        /// Device specific fault code
        code: u16,
    },
}

impl Response {
    /// Decode a device message from a packet
    pub fn from_packet(packet: &Packet) -> Result<Self, ProtocolError> {
        let payload = packet.payload.as_slice();
        match payload {
            [opcode::HELLO_REPLY, rest @ ..] => {
                if rest.len() < 6 || &rest[0..4] != SIGNATURE {
                    return Err(ProtocolError::WrongDevice);
                }
                let version = BigEndian::read_u16(&rest[4..6]);
                // Speed limits exist from version 2 on; trailing bytes from older firmware are ignored
                let limits = if version >= 2 && rest.len() >= 10 {
                    Some((
                        BigEndian::read_i16(&rest[6..8]),
                        BigEndian::read_i16(&rest[8..10]),
                    ))
                } else {
                    None
                };
                Ok(Response::HelloReply { version, limits })
            }
            [opcode::ACK, seq, status] => Ok(Response::Ack {
                seq: *seq,
                status: *status,
            }),
            [opcode::FAULT, code @ ..] if code.len() == 2 => Ok(Response::Fault {
                code: BigEndian::read_u16(code),
            }),
            [opcode::ACK | opcode::FAULT, ..] | [] => Err(ProtocolError::InvalidFrame),
            [op, ..] => Err(ProtocolError::UnknownOpcode(*op)),
        }
    }

    /// Build the packet carrying this message (the device side of the protocol)
    pub fn to_packet(&self) -> Packet {
        match *self {
            Response::HelloReply { version, limits } => {
                let builder = PacketBuilder::new(opcode::HELLO_REPLY)
                    .bytes(SIGNATURE)
                    .u16_be(version);
                match limits {
                    Some((min, max)) => builder.i16_be(min).i16_be(max),
                    None => builder,
                }
                .build()
            }
            Response::Ack { seq, status } => {
                PacketBuilder::new(opcode::ACK).byte(seq).byte(status).build()
            }
            Response::Fault { code } => PacketBuilder::new(opcode::FAULT).u16_be(code).build(),
        }
    }

    /// Encode the message to bytes ready for the transport
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_packet().to_bytes()
    }
}
