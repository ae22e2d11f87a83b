use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use strum_macros::{Display, EnumIter, EnumString};

use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use std::collections::hash_map::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, ErrorKind, Result};

const MAGIC_NUMBER: u8 = 0x08;

/// metadata key carrying a provider-side error message in a response frame.
pub const DUBBO_ERROR_KEY: &str = "dubbo_error";

pub type Metadata = HashMap<String, String>;

#[derive(Debug, Copy, Clone, Display, PartialEq, EnumIter, EnumString, Primitive)]
pub enum MessageType {
    Request = 0,
    Response = 1,
}

#[derive(Debug, Copy, Clone, Display, PartialEq, EnumIter, EnumString, Primitive)]
pub enum MessageStatusType {
    Normal = 0,
    Error = 1,
}

#[derive(Debug, Copy, Clone, Display, PartialEq, EnumIter, EnumString, Primitive)]
pub enum SerializeType {
    SerializeNone = 0,
    JSON = 1,
}

/// a common frame for request and response.
///
/// header layout: magic, version, flag byte (message type bit 7, heartbeat
/// bit 6, oneway bit 5, status bits 0-1), serialize type nibble, big-endian
/// u64 seq. the body is the length-prefixed service path, method, metadata
/// and payload; the payload itself stays opaque to this crate.
#[derive(Debug, Default)]
pub struct Message {
    header: [u8; 12],
    pub service_path: String,
    pub service_method: String,
    pub metadata: Metadata,
    pub payload: BytesMut,
}

impl Message {
    /// Creates a new `Message`
    pub fn new() -> Message {
        let mut msg: Message = Default::default();
        msg.header[0] = MAGIC_NUMBER;
        msg
    }

    pub fn check_magic_number(&self) -> bool {
        self.header[0] == MAGIC_NUMBER
    }

    pub fn get_version(&self) -> u8 {
        self.header[1]
    }
    pub fn set_version(&mut self, v: u8) {
        self.header[1] = v;
    }

    pub fn get_message_type(&self) -> Option<MessageType> {
        MessageType::from_u8((self.header[2] & 0x80) >> 7)
    }
    pub fn set_message_type(&mut self, mt: MessageType) {
        self.header[2] = (self.header[2] & !0x80) | (mt.to_u8().unwrap() << 7);
    }

    pub fn is_heartbeat(&self) -> bool {
        self.header[2] & 0x40 == 0x40
    }
    pub fn set_heartbeat(&mut self, b: bool) {
        if b {
            self.header[2] |= 0x40;
        } else {
            self.header[2] &= !0x40;
        }
    }

    pub fn is_oneway(&self) -> bool {
        self.header[2] & 0x20 == 0x20
    }
    pub fn set_oneway(&mut self, b: bool) {
        if b {
            self.header[2] |= 0x20;
        } else {
            self.header[2] &= !0x20;
        }
    }

    pub fn get_message_status_type(&self) -> Option<MessageStatusType> {
        MessageStatusType::from_u8(self.header[2] & 0x03)
    }
    pub fn set_message_status_type(&mut self, mst: MessageStatusType) {
        self.header[2] = (self.header[2] & !0x03) | (mst.to_u8().unwrap() & 0x03);
    }

    pub fn get_serialize_type(&self) -> Option<SerializeType> {
        SerializeType::from_u8((self.header[3] & 0xF0) >> 4)
    }
    pub fn set_serialize_type(&mut self, st: SerializeType) {
        self.header[3] = (self.header[3] & !0xF0) | (st.to_u8().unwrap() << 4)
    }

    pub fn get_seq(&self) -> u64 {
        BigEndian::read_u64(&self.header[4..])
    }
    pub fn set_seq(&mut self, seq: u64) {
        BigEndian::write_u64(&mut self.header[4..], seq);
    }

    pub fn get_error(&self) -> Option<String> {
        self.metadata.get(DUBBO_ERROR_KEY).cloned()
    }

    /// mark the frame as an error response carrying the given message.
    pub fn set_error(&mut self, err: &str) {
        self.set_message_status_type(MessageStatusType::Error);
        self.metadata.insert(DUBBO_ERROR_KEY.to_owned(), err.to_owned());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        write_str(&mut body, &self.service_path);
        write_str(&mut body, &self.service_method);

        let mut meta = Vec::new();
        for (k, v) in &self.metadata {
            write_str(&mut meta, k);
            write_str(&mut meta, v);
        }
        write_len(&mut body, meta.len() as u32);
        body.extend_from_slice(&meta);

        write_len(&mut body, self.payload.len() as u32);
        body.extend_from_slice(&self.payload);

        let mut data = Vec::with_capacity(12 + 4 + body.len());
        data.extend_from_slice(&self.header);
        write_len(&mut data, body.len() as u32);
        data.extend_from_slice(&body);
        data
    }

    /// read one full frame; the transport's reader task loops on this.
    pub async fn read_from<R>(r: &mut R) -> Result<Message>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 12];
        r.read_exact(&mut header).await?;

        let mut msg = Message {
            header,
            ..Default::default()
        };
        if !msg.check_magic_number() {
            return Err(Error::new(ErrorKind::Network, "bad magic number"));
        }

        let mut lenbuf = [0u8; 4];
        r.read_exact(&mut lenbuf).await?;
        let len = BigEndian::read_u32(&lenbuf) as usize;
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).await?;

        // service_path and service_method
        let (service_path, start) = read_str(&buf, 0)?;
        msg.service_path = service_path;
        let (service_method, start) = read_str(&buf, start)?;
        msg.service_method = service_method;

        // metadata
        let meta_len = read_len(&buf, start)? as usize;
        let meta_end = start + 4 + meta_len;
        let mut meta_start = start + 4;
        while meta_start < meta_end {
            let (key, next) = read_str(&buf, meta_start)?;
            meta_start = next;
            if meta_start < meta_end {
                let (value, next) = read_str(&buf, meta_start)?;
                meta_start = next;
                msg.metadata.insert(key, value);
            } else {
                msg.metadata.insert(key, String::new());
                break;
            }
        }

        // payload
        let payload_len = read_len(&buf, meta_end)? as usize;
        let payload_start = meta_end + 4;
        if payload_start + payload_len > buf.len() {
            return Err(Error::new(ErrorKind::Network, "truncated payload"));
        }
        let mut payload = BytesMut::with_capacity(payload_len);
        payload.extend_from_slice(&buf[payload_start..payload_start + payload_len]);
        msg.payload = payload;

        Ok(msg)
    }
}

fn write_len(buf: &mut Vec<u8>, len: u32) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, len);
    buf.extend_from_slice(&b);
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_len(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn read_len(buf: &[u8], start: usize) -> Result<u32> {
    if start + 4 > buf.len() {
        return Err(Error::new(ErrorKind::Network, "truncated frame"));
    }
    Ok(BigEndian::read_u32(&buf[start..start + 4]))
}

fn read_str(buf: &[u8], start: usize) -> Result<(String, usize)> {
    let len = read_len(buf, start)? as usize;
    let end = start + 4 + len;
    if end > buf.len() {
        return Err(Error::new(ErrorKind::Network, "truncated frame"));
    }
    let s = std::str::from_utf8(&buf[start + 4..end])
        .map_err(|err| Error::new(ErrorKind::Network, err))?;
    Ok((s.to_owned(), end))
}
