//! Message definitions and framing.
//!
//! A frame on the wire is a 4 byte little endian length followed by that
//! many bytes: a single byte message type and the bincode encoded payload.

use std::convert::TryFrom;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_repr::{Deserialize_repr, Serialize_repr};

use campaign_core::{Float, RunId, Var};

use crate::error::{Error, Result};

/// Upper bound on the size of a single frame.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize_repr,
    Deserialize_repr,
)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    Input = 2,
    Output = 3,
    Time = 4,
    Done = 5,
    Ack = 6,
    Rejected = 7,
}

/// Implemented by every message payload.
pub trait Payload: Serialize + DeserializeOwned {
    const TYPE: MessageType;
}

/// Handshake opening a worker session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connect {
    pub run_id: RunId,
}
impl Payload for Connect {
    const TYPE: MessageType = MessageType::Connect;
}

/// Handshake response carrying the run's input row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub values: Vec<Var>,
}
impl Payload for Input {
    const TYPE: MessageType = MessageType::Input;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub values: Vec<Var>,
}
impl Payload for Output {
    const TYPE: MessageType = MessageType::Output;
}

/// Elapsed execution time in seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Time {
    pub secs: Float,
}
impl Payload for Time {
    const TYPE: MessageType = MessageType::Time;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Done {}
impl Payload for Done {
    const TYPE: MessageType = MessageType::Done;
}

/// Confirms the message of the given type was applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub of: MessageType,
}
impl Payload for Ack {
    const TYPE: MessageType = MessageType::Ack;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rejected {
    pub reason: String,
}
impl Payload for Rejected {
    const TYPE: MessageType = MessageType::Rejected;
}

/// Single message, a typed wrapper around an encoded payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub type_: MessageType,
    payload: Vec<u8>,
}

impl Message {
    pub fn from_payload<P: Payload>(payload: &P) -> Result<Message> {
        Ok(Message {
            type_: P::TYPE,
            payload: bincode::serialize(payload)?,
        })
    }

    /// Unpacks the payload, failing if the message is of another type. A
    /// `Rejected` message turns into an error carrying its reason.
    pub fn unpack_payload<P: Payload>(&self) -> Result<P> {
        if self.type_ == P::TYPE {
            return Ok(bincode::deserialize(&self.payload)?);
        }
        if self.type_ == MessageType::Rejected {
            let rejected: Rejected = bincode::deserialize(&self.payload)?;
            return Err(Error::Rejected(rejected.reason));
        }
        Err(Error::UnexpectedMessage {
            expected: P::TYPE,
            got: self.type_,
        })
    }
}

pub fn write_message<W: Write>(writer: &mut W, msg: &Message) -> Result<()> {
    let len = msg.payload.len() as u32 + 1;
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }
    writer.write_u32::<LittleEndian>(len)?;
    writer.write_u8(msg.type_.into())?;
    writer.write_all(&msg.payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
    let len = reader.read_u32::<LittleEndian>()?;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }
    let type_ = MessageType::try_from(reader.read_u8()?)?;
    let mut payload = vec![0; len as usize - 1];
    reader.read_exact(&mut payload)?;
    Ok(Message { type_, payload })
}

/// Encodes and sends a payload.
pub fn send<W: Write, P: Payload>(writer: &mut W, payload: &P) -> Result<()> {
    write_message(writer, &Message::from_payload(payload)?)
}

/// Receives a message and unpacks it as the expected payload.
pub fn recv<R: Read, P: Payload>(reader: &mut R) -> Result<P> {
    read_message(reader)?.unpack_payload()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_carries_length_and_type() {
        let mut buf = Vec::new();
        send(&mut buf, &Connect { run_id: 7 }).unwrap();
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len() - 4);
        assert_eq!(buf[4], MessageType::Connect as u8);
        let connect: Connect = recv(&mut buf.as_slice()).unwrap();
        assert_eq!(connect.run_id, 7);
    }

    #[test]
    fn rejection_and_wrong_type_are_errors() {
        let mut buf = Vec::new();
        send(
            &mut buf,
            &Rejected {
                reason: "unknown run 3".to_string(),
            },
        )
        .unwrap();
        send(&mut buf, &Time { secs: 1.5 }).unwrap();
        let mut reader = buf.as_slice();
        match recv::<_, Input>(&mut reader) {
            Err(Error::Rejected(reason)) => assert_eq!(reason, "unknown run 3"),
            other => panic!("unexpected: {:?}", other),
        }
        match recv::<_, Ack>(&mut reader) {
            Err(Error::UnexpectedMessage { expected, got }) => {
                assert_eq!(expected, MessageType::Ack);
                assert_eq!(got, MessageType::Time);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unknown_type_and_oversized_frames_fail() {
        let bytes = [2u8, 0, 0, 0, 99, 0];
        assert!(matches!(
            read_message(&mut &bytes[..]),
            Err(Error::UnknownMsgCode(_))
        ));
        let bytes = [255u8, 255, 255, 255];
        assert!(matches!(
            read_message(&mut &bytes[..]),
            Err(Error::FrameTooLarge(_))
        ));
    }
}
