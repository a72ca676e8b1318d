pub mod stream;

use bytes::{Buf, BufMut};

use crate::error::CatsError;

/// Separator between the message-header JSON and the payload inside a frame
///  body. Header JSON must never contain NUL bytes because of this.
pub const HEADER_SEPARATOR: &[u8; 2] = b"\x00\x00";

/// The five frame families plus ping. The type byte is the first byte of
///  every frame; everything after it is family specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Request = 0x00,
    Stream = 0x01,
    Input = 0x02,
    DownloadSpeed = 0x05,
    CancelInput = 0x06,
    Ping = 0xFF,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Result<FrameType, CatsError> {
        match value {
            0x00 => Ok(FrameType::Request),
            0x01 => Ok(FrameType::Stream),
            0x02 => Ok(FrameType::Input),
            0x05 => Ok(FrameType::DownloadSpeed),
            0x06 => Ok(FrameType::CancelInput),
            0xFF => Ok(FrameType::Ping),
            n => Err(CatsError::protocol(format!(
                "unknown frame type {:#04x}",
                n
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Fixed header of 0x00 frames. `data_len` covers the message headers, the
///  separator and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub handler_id: u16,
    pub message_id: u16,
    pub send_time: u64,
    pub data_type: u8,
    pub compression: u8,
    pub data_len: u32,
}

impl RequestHead {
    pub const SERIALIZED_LEN: usize = 18;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.handler_id);
        buf.put_u16(self.message_id);
        buf.put_u64(self.send_time);
        buf.put_u8(self.data_type);
        buf.put_u8(self.compression);
        buf.put_u32(self.data_len);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RequestHead> {
        Ok(RequestHead {
            handler_id: buf.try_get_u16()?,
            message_id: buf.try_get_u16()?,
            send_time: buf.try_get_u64()?,
            data_type: buf.try_get_u8()?,
            compression: buf.try_get_u8()?,
            data_len: buf.try_get_u32()?,
        })
    }
}

/// Fixed header of 0x01 frames. No payload length - the body is a chunk
///  sequence terminated by a zero-length chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHead {
    pub handler_id: u16,
    pub message_id: u16,
    pub send_time: u64,
    pub data_type: u8,
    pub compression: u8,
}

impl StreamHead {
    pub const SERIALIZED_LEN: usize = 14;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.handler_id);
        buf.put_u16(self.message_id);
        buf.put_u64(self.send_time);
        buf.put_u8(self.data_type);
        buf.put_u8(self.compression);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<StreamHead> {
        Ok(StreamHead {
            handler_id: buf.try_get_u16()?,
            message_id: buf.try_get_u16()?,
            send_time: buf.try_get_u64()?,
            data_type: buf.try_get_u8()?,
            compression: buf.try_get_u8()?,
        })
    }
}

/// Fixed header of 0x02 frames. The message id threads the nested exchange
///  into the top-level exchange it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputHead {
    pub message_id: u16,
    pub data_type: u8,
    pub compression: u8,
    pub data_len: u32,
}

impl InputHead {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.message_id);
        buf.put_u8(self.data_type);
        buf.put_u8(self.compression);
        buf.put_u32(self.data_len);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<InputHead> {
        Ok(InputHead {
            message_id: buf.try_get_u16()?,
            data_type: buf.try_get_u8()?,
            compression: buf.try_get_u8()?,
            data_len: buf.try_get_u32()?,
        })
    }
}
