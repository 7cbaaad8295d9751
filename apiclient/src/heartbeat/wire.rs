// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Binary codec for the heartbeat datagrams. Integers are big-endian;
//! variable-length fields carry a varint length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const MSG_HEARTBEAT_REQ: u16 = 513;
pub const MSG_HEARTBEAT_RESP: u16 = 258;
pub const MSG_INVITE_REQ: u16 = 259;
pub const MSG_INVITE_RESP: u16 = 516;

/// Protocol mask carried in every header. The server echoes it back.
pub const WIRE_MASK: u64 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram truncated")]
    Truncated,
    #[error("varint overflows u64")]
    VarintOverflow,
    #[error("unknown message type: {0}")]
    UnknownType(u16),
    #[error("field is not valid utf-8")]
    InvalidUtf8,
    #[error("payload size mismatch: declared {declared}, actual {actual}")]
    PayloadSize { declared: usize, actual: usize },
}

/// Header preceding every heartbeat datagram:
/// `{mask: varint, seq: varint, type: u16, payload_size: u16}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub mask: u64,
    pub seq: u64,
    pub msg_type: u16,
    pub payload_size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatMessage {
    HeartbeatReq {
        aid: String,
        sign_cookie: u64,
    },
    HeartbeatResp {
        /// Seconds until the next beat; 0 keeps the default cadence.
        next_beat: u64,
    },
    InviteReq(InviteReq),
    InviteResp {
        aid: String,
        inviter: String,
        session_id: String,
        sign_cookie: u64,
    },
}

/// Session invitation relayed over the heartbeat channel while the
/// message channel may not be up yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteReq {
    pub inviter: String,
    pub invite_code: String,
    pub invite_code_expire: i64,
    pub session_id: String,
    pub message_server: String,
}

impl HeartbeatMessage {
    pub fn msg_type(&self) -> u16 {
        match self {
            HeartbeatMessage::HeartbeatReq { .. } => MSG_HEARTBEAT_REQ,
            HeartbeatMessage::HeartbeatResp { .. } => MSG_HEARTBEAT_RESP,
            HeartbeatMessage::InviteReq(_) => MSG_INVITE_REQ,
            HeartbeatMessage::InviteResp { .. } => MSG_INVITE_RESP,
        }
    }
}

pub fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

pub fn get_varint(buf: &mut impl Buf) -> Result<u64, WireError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(WireError::Truncated);
        }
        let byte = buf.get_u8();
        if shift >= 64 || (shift == 63 && byte > 1) {
            return Err(WireError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    put_varint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String, WireError> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

/// Encodes a message into a single datagram with the given sequence
/// number.
pub fn encode(message: &HeartbeatMessage, seq: u64) -> BytesMut {
    let mut payload = BytesMut::new();
    match message {
        HeartbeatMessage::HeartbeatReq { aid, sign_cookie } => {
            put_string(&mut payload, aid);
            payload.put_u64(*sign_cookie);
        }
        HeartbeatMessage::HeartbeatResp { next_beat } => {
            put_varint(&mut payload, *next_beat);
        }
        HeartbeatMessage::InviteReq(invite) => {
            put_string(&mut payload, &invite.inviter);
            put_string(&mut payload, &invite.invite_code);
            payload.put_i64(invite.invite_code_expire);
            put_string(&mut payload, &invite.session_id);
            put_string(&mut payload, &invite.message_server);
        }
        HeartbeatMessage::InviteResp {
            aid,
            inviter,
            session_id,
            sign_cookie,
        } => {
            put_string(&mut payload, aid);
            put_string(&mut payload, inviter);
            put_string(&mut payload, session_id);
            payload.put_u64(*sign_cookie);
        }
    }

    let mut datagram = BytesMut::new();
    put_varint(&mut datagram, WIRE_MASK);
    put_varint(&mut datagram, seq);
    datagram.put_u16(message.msg_type());
    datagram.put_u16(payload.len() as u16);
    datagram.extend_from_slice(&payload);
    datagram
}

/// Decodes one datagram into its header and message.
pub fn decode(datagram: &[u8]) -> Result<(Header, HeartbeatMessage), WireError> {
    let mut buf = Bytes::copy_from_slice(datagram);
    let mask = get_varint(&mut buf)?;
    let seq = get_varint(&mut buf)?;
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let msg_type = buf.get_u16();
    let payload_size = buf.get_u16();
    let header = Header {
        mask,
        seq,
        msg_type,
        payload_size,
    };
    if buf.remaining() != payload_size as usize {
        return Err(WireError::PayloadSize {
            declared: payload_size as usize,
            actual: buf.remaining(),
        });
    }

    let message = match msg_type {
        MSG_HEARTBEAT_REQ => {
            let aid = get_string(&mut buf)?;
            if buf.remaining() < 8 {
                return Err(WireError::Truncated);
            }
            let sign_cookie = buf.get_u64();
            HeartbeatMessage::HeartbeatReq { aid, sign_cookie }
        }
        MSG_HEARTBEAT_RESP => HeartbeatMessage::HeartbeatResp {
            next_beat: get_varint(&mut buf)?,
        },
        MSG_INVITE_REQ => {
            let inviter = get_string(&mut buf)?;
            let invite_code = get_string(&mut buf)?;
            if buf.remaining() < 8 {
                return Err(WireError::Truncated);
            }
            let invite_code_expire = buf.get_i64();
            let session_id = get_string(&mut buf)?;
            let message_server = get_string(&mut buf)?;
            HeartbeatMessage::InviteReq(InviteReq {
                inviter,
                invite_code,
                invite_code_expire,
                session_id,
                message_server,
            })
        }
        MSG_INVITE_RESP => {
            let aid = get_string(&mut buf)?;
            let inviter = get_string(&mut buf)?;
            let session_id = get_string(&mut buf)?;
            if buf.remaining() < 8 {
                return Err(WireError::Truncated);
            }
            let sign_cookie = buf.get_u64();
            HeartbeatMessage::InviteResp {
                aid,
                inviter,
                session_id,
                sign_cookie,
            }
        }
        other => return Err(WireError::UnknownType(other)),
    };
    Ok((header, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            let mut bytes = buf.freeze();
            assert_eq!(get_varint(&mut bytes).unwrap(), value);
            assert!(!bytes.has_remaining());
        }
    }

    #[test]
    fn heartbeat_req_layout() {
        let message = HeartbeatMessage::HeartbeatReq {
            aid: "bob.ex.com".to_string(),
            sign_cookie: 0xdead_beef_cafe_f00d,
        };
        let datagram = encode(&message, 42);
        let (header, decoded) = decode(&datagram).unwrap();
        assert_eq!(header.seq, 42);
        assert_eq!(header.msg_type, MSG_HEARTBEAT_REQ);
        // varint aid length + aid + 8-byte cookie
        assert_eq!(header.payload_size as usize, 1 + 10 + 8);
        assert_eq!(decoded, message);
    }

    #[test]
    fn invite_round_trip() {
        let message = HeartbeatMessage::InviteReq(InviteReq {
            inviter: "alice.ex.com".to_string(),
            invite_code: "c0de".to_string(),
            invite_code_expire: 1_700_000_999_000,
            session_id: "s2".to_string(),
            message_server: "msg.ex.com".to_string(),
        });
        let datagram = encode(&message, 7);
        let (_, decoded) = decode(&datagram).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        let message = HeartbeatMessage::HeartbeatResp { next_beat: 30 };
        let datagram = encode(&message, 1);
        let cut = &datagram[..datagram.len() - 1];
        assert!(decode(cut).is_err());
    }
}
