//! Aligned byte-level marshalling of dynamic values.
//!
//! Alignment is relative to the start of the message, so both cursors carry
//! absolute offsets. Outbound data is written in native byte order (the
//! message header carries the order mark); inbound data honors the order
//! the peer declared.

use std::os::fd::OwnedFd;

use crate::errors::{Error, Result};
use crate::types::{alignment_of, split_first_complete, ObjectPath, Signature, UnixFd};
use crate::value::Value;

/// Hard cap on a single array's payload, per the wire protocol.
pub const MAX_ARRAY_LEN: usize = 1 << 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endian {
    Little,
    Big,
}

impl Endian {
    pub(crate) fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub(crate) fn marker(self) -> u8 {
        match self {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }
    }

    pub(crate) fn from_marker(marker: u8) -> Result<Self> {
        match marker {
            b'l' => Ok(Endian::Little),
            b'B' => Ok(Endian::Big),
            other => Err(Error::MalformedMessage(format!(
                "unknown byte order marker 0x{other:02x}"
            ))),
        }
    }
}

/// Write cursor over a message under construction.
pub(crate) struct EncodeBuf {
    pub data: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl EncodeBuf {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(256),
            fds: Vec::new(),
        }
    }

    pub fn pad(&mut self, alignment: usize) {
        let needed = (alignment - self.data.len() % alignment) % alignment;
        self.data.resize(self.data.len() + needed, 0);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.pad(2);
        self.data.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.pad(4);
        self.data.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.pad(8);
        self.data.extend_from_slice(&value.to_ne_bytes());
    }

    /// Reserve a u32 slot to be patched once its value is known.
    pub fn reserve_u32(&mut self) -> usize {
        self.pad(4);
        let at = self.data.len();
        self.data.extend_from_slice(&[0; 4]);
        at
    }

    pub fn patch_u32(&mut self, at: usize, value: u32) {
        self.data[at..at + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn put_str(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
    }

    fn put_signature(&mut self, value: &Signature) {
        self.data.push(value.as_str().len() as u8);
        self.data.extend_from_slice(value.as_str().as_bytes());
        self.data.push(0);
    }
}

/// Encode one value at the cursor.
pub(crate) fn encode_value(value: Value, buf: &mut EncodeBuf) -> Result<()> {
    match value {
        Value::Byte(v) => buf.put_u8(v),
        Value::Bool(v) => buf.put_u32(v as u32),
        Value::Int16(v) => buf.put_u16(v as u16),
        Value::Uint16(v) => buf.put_u16(v),
        Value::Int32(v) => buf.put_u32(v as u32),
        Value::Uint32(v) => buf.put_u32(v),
        Value::Int64(v) => buf.put_u64(v as u64),
        Value::Uint64(v) => buf.put_u64(v),
        Value::Double(v) => buf.put_u64(v.to_bits()),
        Value::String(v) => buf.put_str(&v),
        Value::ObjectPath(v) => buf.put_str(v.as_str()),
        Value::Signature(v) => buf.put_signature(&v),
        Value::UnixFd(mut v) => {
            let fd = v
                .take()
                .ok_or_else(|| Error::SendFailure("file descriptor already taken".into()))?;
            buf.put_u32(buf.fds.len() as u32);
            buf.fds.push(fd);
        }
        Value::Array(elem, items) => {
            let at = buf.reserve_u32();
            // the padding before the first element is not part of the
            // array length, so insert it even when the array is empty
            buf.pad(alignment_of(elem.as_str().as_bytes()[0]));

            let start = buf.data.len();
            for item in items {
                encode_value(item, buf)?;
            }

            let len = buf.data.len() - start;
            if len > MAX_ARRAY_LEN {
                return Err(Error::SendFailure(format!(
                    "array of {len} bytes exceeds the protocol limit"
                )));
            }
            buf.patch_u32(at, len as u32);
        }
        Value::Struct(fields) => {
            buf.pad(8);
            for field in fields {
                encode_value(field, buf)?;
            }
        }
        Value::DictEntry(key, value) => {
            buf.pad(8);
            encode_value(*key, buf)?;
            encode_value(*value, buf)?;
        }
        Value::Variant(inner) => {
            buf.put_signature(&inner.signature());
            encode_value(*inner, buf)?;
        }
    }

    Ok(())
}

/// Read cursor over a received message.
pub(crate) struct DecodeBuf<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
    fds: &'a mut Vec<Option<OwnedFd>>,
}

impl<'a> DecodeBuf<'a> {
    pub fn new(data: &'a [u8], endian: Endian, fds: &'a mut Vec<Option<OwnedFd>>) -> Self {
        Self {
            data,
            pos: 0,
            endian,
            fds,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn pad(&mut self, alignment: usize) -> Result<()> {
        let needed = (alignment - self.pos % alignment) % alignment;
        self.take(needed).map(drop)
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(Error::MalformedMessage(
                "message truncated mid-argument".into(),
            ));
        }

        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.pad(2)?;
        let bytes = self.take(2)?.try_into().unwrap();
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        })
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.pad(4)?;
        let bytes = self.take(4)?.try_into().unwrap();
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        })
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.pad(8)?;
        let bytes = self.take(8)?.try_into().unwrap();
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(bytes),
            Endian::Big => u64::from_be_bytes(bytes),
        })
    }

    fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let raw = self.take(len + 1)?;
        String::from_utf8(raw[..len].to_vec())
            .map_err(|_| Error::MalformedMessage("string argument is not valid UTF-8".into()))
    }

    pub fn get_signature(&mut self) -> Result<Signature> {
        let len = self.get_u8()? as usize;
        let raw = self.take(len + 1)?;
        let text = std::str::from_utf8(&raw[..len])
            .map_err(|_| Error::MalformedMessage("signature is not valid UTF-8".into()))?;
        Signature::new(text)
    }
}

/// Decode one value of signature `sig` (a single complete type) at the
/// cursor.
pub(crate) fn decode_value(buf: &mut DecodeBuf, sig: &str) -> Result<Value> {
    let code = sig.as_bytes()[0];

    let value = match code {
        b'y' => Value::Byte(buf.get_u8()?),
        b'b' => match buf.get_u32()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => {
                return Err(Error::MalformedMessage(format!(
                    "boolean encoded as {other}"
                )))
            }
        },
        b'n' => Value::Int16(buf.get_u16()? as i16),
        b'q' => Value::Uint16(buf.get_u16()?),
        b'i' => Value::Int32(buf.get_u32()? as i32),
        b'u' => Value::Uint32(buf.get_u32()?),
        b'x' => Value::Int64(buf.get_u64()? as i64),
        b't' => Value::Uint64(buf.get_u64()?),
        b'd' => Value::Double(f64::from_bits(buf.get_u64()?)),
        b's' => Value::String(buf.get_str()?),
        b'o' => Value::ObjectPath(ObjectPath::new(buf.get_str()?)?),
        b'g' => Value::Signature(buf.get_signature()?),
        b'h' => {
            let index = buf.get_u32()? as usize;
            let fd = buf
                .fds
                .get_mut(index)
                .and_then(Option::take)
                .ok_or_else(|| {
                    Error::MalformedMessage(format!("no file descriptor at index {index}"))
                })?;
            Value::UnixFd(UnixFd::new(fd))
        }
        b'a' => {
            let elem = &sig[1..];
            let len = buf.get_u32()? as usize;
            if len > MAX_ARRAY_LEN {
                return Err(Error::MalformedMessage(format!(
                    "array of {len} bytes exceeds the protocol limit"
                )));
            }

            buf.pad(alignment_of(elem.as_bytes()[0]))?;
            let end = buf.position() + len;

            let mut items = Vec::new();
            while buf.position() < end {
                items.push(decode_value(buf, elem)?);
            }
            if buf.position() != end {
                return Err(Error::MalformedMessage(
                    "array elements overrun the declared length".into(),
                ));
            }

            Value::Array(Signature::new(elem)?, items)
        }
        b'(' => {
            buf.pad(8)?;
            let mut fields = Vec::new();
            let mut rest = &sig[1..sig.len() - 1];
            while !rest.is_empty() {
                let (head, tail) = split_first_complete(rest)
                    .ok_or_else(|| Error::InvalidSignature(sig.into()))?;
                fields.push(decode_value(buf, head)?);
                rest = tail;
            }
            Value::Struct(fields)
        }
        b'{' => {
            buf.pad(8)?;
            let inner = &sig[1..sig.len() - 1];
            let (key_sig, value_sig) = split_first_complete(inner)
                .ok_or_else(|| Error::InvalidSignature(sig.into()))?;
            let key = decode_value(buf, key_sig)?;
            let value = decode_value(buf, value_sig)?;
            Value::DictEntry(Box::new(key), Box::new(value))
        }
        b'v' => {
            let inner_sig = buf.get_signature()?;
            if !inner_sig.is_single_complete_type() {
                return Err(Error::InvalidSignature(inner_sig.as_str().into()));
            }
            let inner = decode_value(buf, inner_sig.as_str())?;
            Value::Variant(Box::new(inner))
        }
        other => return Err(Error::InvalidSignature((other as char).to_string())),
    };

    Ok(value)
}
