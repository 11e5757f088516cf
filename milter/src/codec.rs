//! Framing and payload codec for the sendmail milter protocol (v6 subset).
//!
//! Every packet is a big-endian u32 length, one command byte, then a
//! command-specific payload. String fields are NUL-terminated.

use std::io;
use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use miette::Diagnostic;
use nom::{
    bytes::complete::{take, take_till},
    number::complete::{be_u16, be_u32},
    IResult, Parser,
};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::Response;

/// Highest protocol version this filter negotiates.
pub const MILTER_VERSION: u32 = 6;

/// Upper bound on a single frame; body chunks the MTA sends stay well below
/// this.
pub const DEFAULT_MAX_FRAME: usize = 1 << 16;

const SMFIC_ABORT: u8 = b'A';
const SMFIC_BODY: u8 = b'B';
const SMFIC_CONNECT: u8 = b'C';
const SMFIC_MACRO: u8 = b'D';
const SMFIC_BODYEOB: u8 = b'E';
const SMFIC_HELO: u8 = b'H';
const SMFIC_QUIT_NC: u8 = b'K';
const SMFIC_HEADER: u8 = b'L';
const SMFIC_MAIL: u8 = b'M';
const SMFIC_EOH: u8 = b'N';
const SMFIC_OPTNEG: u8 = b'O';
const SMFIC_QUIT: u8 = b'Q';
const SMFIC_RCPT: u8 = b'R';
const SMFIC_DATA: u8 = b'T';

const SMFIR_CONTINUE: u8 = b'c';
const SMFIR_REPLYCODE: u8 = b'y';

const SMFIA_UNKNOWN: u8 = b'U';

#[derive(Debug, Error, Diagnostic)]
pub enum CodecError {
    #[error("IO error")]
    #[diagnostic(code(milter::io_error))]
    Io(#[from] io::Error),

    #[error("empty milter frame")]
    #[diagnostic(code(milter::empty_frame))]
    EmptyFrame,

    #[error("milter frame of {len} bytes exceeds the {max} byte limit")]
    #[diagnostic(code(milter::frame_too_large))]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed payload for milter command {command:?}")]
    #[diagnostic(code(milter::malformed_payload))]
    MalformedPayload { command: char },
}

/// One decoded packet from the MTA.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    OptNeg {
        version: u32,
        actions: u32,
        protocol: u32,
    },
    Macro {
        stage: u8,
        symbols: Vec<(String, String)>,
    },
    Connect {
        hostname: String,
        port: u16,
        address: Option<IpAddr>,
    },
    Helo(String),
    Mail(Vec<String>),
    Rcpt(Vec<String>),
    Data,
    Header {
        name: String,
        value: String,
    },
    EndOfHeaders,
    Body(Bytes),
    EndOfBody(Bytes),
    Abort,
    Quit,
    QuitNewConnection,
    Unknown(Bytes),
}

/// One packet sent back to the MTA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    OptNeg {
        version: u32,
        actions: u32,
        protocol: u32,
    },
    Continue,
    /// An SMTP reply line, e.g. `421 4.7.0 try again later`.
    ReplyCode(String),
}

impl From<&Response> for ServerMessage {
    fn from(response: &Response) -> Self {
        match response {
            Response::Continue => ServerMessage::Continue,
            Response::TempFail(reply) | Response::Reject(reply) => {
                ServerMessage::ReplyCode(reply.smtp_line())
            }
        }
    }
}

pub struct MilterCodec {
    max_frame: usize,
}

impl MilterCodec {
    pub fn new(max_frame: usize) -> Self {
        MilterCodec { max_frame }
    }
}

impl Default for MilterCodec {
    fn default() -> Self {
        MilterCodec::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for MilterCodec {
    type Item = ClientCommand;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClientCommand>, CodecError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len == 0 {
            return Err(CodecError::EmptyFrame);
        }
        if len > self.max_frame {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(len).freeze();
        let command = frame[0];
        let payload = frame.slice(1..);
        parse_command(command, payload).map(Some)
    }
}

impl Encoder<ServerMessage> for MilterCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ServerMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        match item {
            ServerMessage::Continue => write_frame(dst, SMFIR_CONTINUE, &[]),
            ServerMessage::ReplyCode(line) => {
                let mut payload = Vec::with_capacity(line.len() + 1);
                payload.extend_from_slice(line.as_bytes());
                payload.push(0);
                write_frame(dst, SMFIR_REPLYCODE, &payload);
            }
            ServerMessage::OptNeg {
                version,
                actions,
                protocol,
            } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&version.to_be_bytes());
                payload.extend_from_slice(&actions.to_be_bytes());
                payload.extend_from_slice(&protocol.to_be_bytes());
                write_frame(dst, SMFIC_OPTNEG, &payload);
            }
        }
        Ok(())
    }
}

fn write_frame(dst: &mut BytesMut, command: u8, payload: &[u8]) {
    dst.reserve(5 + payload.len());
    dst.put_u32(payload.len() as u32 + 1);
    dst.put_u8(command);
    dst.put_slice(payload);
}

fn parse_command(command: u8, payload: Bytes) -> Result<ClientCommand, CodecError> {
    let cmd = match command {
        SMFIC_OPTNEG => {
            let (version, actions, protocol) = finish(command, optneg_payload(&payload))?;
            ClientCommand::OptNeg {
                version,
                actions,
                protocol,
            }
        }
        SMFIC_MACRO => {
            let (stage, symbols) = finish(command, macro_payload(&payload))?;
            ClientCommand::Macro { stage, symbols }
        }
        SMFIC_CONNECT => {
            let (hostname, port, address) = finish(command, connect_payload(&payload))?;
            ClientCommand::Connect {
                hostname,
                port,
                address,
            }
        }
        SMFIC_HELO => ClientCommand::Helo(finish(command, c_string(&payload))?),
        SMFIC_MAIL => ClientCommand::Mail(finish(command, string_list(&payload))?),
        SMFIC_RCPT => ClientCommand::Rcpt(finish(command, string_list(&payload))?),
        SMFIC_DATA => ClientCommand::Data,
        SMFIC_HEADER => {
            let (name, value) = finish(command, header_payload(&payload))?;
            ClientCommand::Header { name, value }
        }
        SMFIC_EOH => ClientCommand::EndOfHeaders,
        SMFIC_BODY => ClientCommand::Body(payload),
        SMFIC_BODYEOB => ClientCommand::EndOfBody(payload),
        SMFIC_ABORT => ClientCommand::Abort,
        SMFIC_QUIT => ClientCommand::Quit,
        SMFIC_QUIT_NC => ClientCommand::QuitNewConnection,
        _ => ClientCommand::Unknown(payload),
    };
    Ok(cmd)
}

fn finish<O>(command: u8, result: IResult<&[u8], O>) -> Result<O, CodecError> {
    match result {
        Ok((_, value)) => Ok(value),
        Err(_) => Err(CodecError::MalformedPayload {
            command: command as char,
        }),
    }
}

/// A NUL-terminated string field; lenient about a missing terminator at the
/// very end of a payload.
fn c_string(input: &[u8]) -> IResult<&[u8], String> {
    let (rest, raw) = take_till(|b| b == 0).parse(input)?;
    let rest = if rest.is_empty() { rest } else { &rest[1..] };
    Ok((rest, String::from_utf8_lossy(raw).into_owned()))
}

fn string_list(input: &[u8]) -> IResult<&[u8], Vec<String>> {
    let mut items = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let (next, item) = c_string(rest)?;
        items.push(item);
        rest = next;
    }
    Ok((rest, items))
}

fn optneg_payload(input: &[u8]) -> IResult<&[u8], (u32, u32, u32)> {
    let (input, version) = be_u32.parse(input)?;
    let (input, actions) = be_u32.parse(input)?;
    let (input, protocol) = be_u32.parse(input)?;
    Ok((input, (version, actions, protocol)))
}

fn macro_payload(input: &[u8]) -> IResult<&[u8], (u8, Vec<(String, String)>)> {
    let (input, stage) = take(1usize).parse(input)?;
    let (input, items) = string_list(input)?;

    let mut symbols = Vec::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let Some(name) = items.next() {
        let value = items.next().unwrap_or_default();
        symbols.push((name, value));
    }
    Ok((input, (stage[0], symbols)))
}

fn connect_payload(input: &[u8]) -> IResult<&[u8], (String, u16, Option<IpAddr>)> {
    let (input, hostname) = c_string(input)?;
    let (input, family) = take(1usize).parse(input)?;
    if family[0] == SMFIA_UNKNOWN || input.is_empty() {
        return Ok((input, (hostname, 0, None)));
    }
    let (input, port) = be_u16.parse(input)?;
    let (input, address) = c_string(input)?;
    // Unix socket paths simply don't parse as an IP.
    let address = address.parse().ok();
    Ok((input, (hostname, port, address)))
}

fn header_payload(input: &[u8]) -> IResult<&[u8], (String, String)> {
    let (input, name) = c_string(input)?;
    let (input, value) = c_string(input)?;
    Ok((input, (name, value)))
}
