//! The in-memory representation of one protocol frame: header fields,
//! typed arguments, factories for the four message kinds, reader/writer
//! cursors and the wire marshalling.

use std::mem;
use std::os::fd::OwnedFd;

use bytes::{Buf, BytesMut};
use log::*;

use crate::arg::{ArgList, BusType};
use crate::codec::{decode_value, encode_value, DecodeBuf, EncodeBuf, Endian};
use crate::errors::{Error, Result};
use crate::names;
use crate::types::{split_first_complete, ObjectPath, Signature};
use crate::value::Value;

/// Wire protocol version implemented by this crate.
pub const PROTOCOL_VERSION: u8 = 1;
/// Hard cap on a whole message, per the wire protocol.
pub const MAX_MESSAGE_SIZE: usize = 1 << 27;

/// Flag on method calls that do not want a reply.
pub const FLAG_NO_REPLY_EXPECTED: u8 = 0x1;

// Header field codes of the wire protocol.
const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind {
    #[default]
    Invalid,
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageKind {
    fn as_byte(self) -> u8 {
        match self {
            MessageKind::Invalid => 0,
            MessageKind::MethodCall => 1,
            MessageKind::MethodReturn => 2,
            MessageKind::Error => 3,
            MessageKind::Signal => 4,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            1 => MessageKind::MethodCall,
            2 => MessageKind::MethodReturn,
            3 => MessageKind::Error,
            4 => MessageKind::Signal,
            _ => MessageKind::Invalid,
        }
    }
}

/// One protocol frame. Built through the factories and a [`Writer`], or
/// decoded off the wire; immutable once sent or received apart from the
/// take-style argument accessors.
#[derive(Debug, Default)]
pub struct Message {
    kind: MessageKind,
    serial: u32,
    flags: u8,
    reply_serial: Option<u32>,
    path: Option<ObjectPath>,
    interface: Option<String>,
    member: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    error_name: Option<String>,
    args: Vec<Value>,
}

impl Message {
    /// A method call addressed to `destination`'s object on `path`.
    pub fn method_call(
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<Self> {
        names::validate_bus_name(destination)?;
        names::validate_interface_name(interface)?;
        names::validate_member_name(member)?;

        Ok(Self {
            kind: MessageKind::MethodCall,
            path: Some(ObjectPath::new(path)?),
            interface: Some(interface.into()),
            member: Some(member.into()),
            destination: Some(destination.into()),
            ..Default::default()
        })
    }

    /// An empty reply linked to `call`'s serial.
    pub fn method_return(call: &Message) -> Self {
        Self {
            kind: MessageKind::MethodReturn,
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            ..Default::default()
        }
    }

    /// A signal emitted from `path`.
    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Self> {
        names::validate_interface_name(interface)?;
        names::validate_member_name(member)?;

        Ok(Self {
            kind: MessageKind::Signal,
            path: Some(ObjectPath::new(path)?),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Default::default()
        })
    }

    /// An error reply linked to `call`'s serial. The human-readable text
    /// becomes the first body argument, as peers expect.
    pub fn error(call: &Message, error_name: &str, text: &str) -> Result<Self> {
        names::validate_error_name(error_name)?;

        Ok(Self {
            kind: MessageKind::Error,
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            error_name: Some(error_name.into()),
            args: vec![Value::String(text.into())],
            ..Default::default()
        })
    }

    /// An error reply built from a library error value.
    pub fn error_from(call: &Message, error: &Error) -> Self {
        // the wire name is always valid, so this cannot fail
        Self::error(call, error.wire_name(), &error.to_string()).unwrap()
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Serial assigned on send; zero until the message has been queued.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn path(&self) -> Option<&ObjectPath> {
        self.path.as_ref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub fn no_reply_expected(&self) -> bool {
        self.flags & FLAG_NO_REPLY_EXPECTED != 0
    }

    pub fn set_no_reply_expected(&mut self) {
        self.flags |= FLAG_NO_REPLY_EXPECTED;
    }

    /// Signature of the argument list.
    pub fn signature(&self) -> Signature {
        let mut sig = Signature::empty();
        for arg in &self.args {
            sig.extend(&arg.signature());
        }
        sig
    }

    /// Borrow the arguments without consuming them.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Writer cursor appending arguments to a locally constructed message.
    pub fn writer(&mut self) -> Writer<'_> {
        Writer {
            msg: self,
            stack: Vec::new(),
        }
    }

    /// Reader cursor over the arguments. Reading consumes them; a second
    /// reader starts out empty.
    pub fn reader(&mut self) -> Reader {
        Reader::new(mem::take(&mut self.args))
    }

    /// Encode a whole argument list in one step.
    pub fn write_args<T: ArgList>(&mut self, args: T) -> Result<()> {
        let mut writer = self.writer();
        for value in args.into_values() {
            writer.push_value(value)?;
        }
        Ok(())
    }

    /// Decode the whole argument list in one step.
    pub fn read_args<T: ArgList>(&mut self) -> Result<T> {
        T::from_values(mem::take(&mut self.args))
    }

    /// Stamp the serial. Normally the connection assigns one as the
    /// message is queued; daemon-side tooling stamps its own.
    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    /// Stamp the sending connection's unique name, the way the daemon does
    /// before forwarding a message.
    pub fn set_sender(&mut self, sender: &str) {
        self.sender = Some(sender.into());
    }

    /// Copy of the header fields with an empty body, enough to link
    /// replies to this message after its arguments were consumed.
    pub fn header_clone(&self) -> Self {
        Self {
            kind: self.kind,
            serial: self.serial,
            flags: self.flags,
            reply_serial: self.reply_serial,
            path: self.path.clone(),
            interface: self.interface.clone(),
            member: self.member.clone(),
            destination: self.destination.clone(),
            sender: self.sender.clone(),
            error_name: self.error_name.clone(),
            args: Vec::new(),
        }
    }

    /// Duplicate the message for fan-out to several consumers. Descriptor
    /// arguments are duplicated with `dup`.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            kind: self.kind,
            serial: self.serial,
            flags: self.flags,
            reply_serial: self.reply_serial,
            path: self.path.clone(),
            interface: self.interface.clone(),
            member: self.member.clone(),
            destination: self.destination.clone(),
            sender: self.sender.clone(),
            error_name: self.error_name.clone(),
            args: self
                .args
                .iter()
                .map(Value::try_clone)
                .collect::<Result<Vec<_>>>()?,
        })
    }

    fn required_headers_present(&self) -> bool {
        match self.kind {
            MessageKind::MethodCall | MessageKind::Signal => {
                self.path.is_some() && self.interface.is_some() && self.member.is_some()
            }
            MessageKind::MethodReturn => self.reply_serial.is_some(),
            MessageKind::Error => self.reply_serial.is_some() && self.error_name.is_some(),
            MessageKind::Invalid => false,
        }
    }

    /// Marshal into wire bytes plus the descriptors riding along with them.
    /// Consumes the message: once sent it cannot be touched again.
    pub fn to_wire(mut self, serial: u32) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
        self.serial = serial;

        if serial == 0 || !self.required_headers_present() {
            return Err(Error::SendFailure(format!(
                "message of kind {:?} is missing required headers",
                self.kind
            )));
        }

        let signature = self.signature();

        // body first: it starts 8-aligned, so a fresh buffer encodes it
        // with the right padding and yields the body length for the header
        let mut body = EncodeBuf::new();
        for arg in mem::take(&mut self.args) {
            encode_value(arg, &mut body)?;
        }

        let mut fields: Vec<(u8, Value)> = Vec::with_capacity(8);
        if let Some(path) = self.path.take() {
            fields.push((FIELD_PATH, Value::ObjectPath(path)));
        }
        if let Some(interface) = self.interface.take() {
            fields.push((FIELD_INTERFACE, Value::String(interface)));
        }
        if let Some(member) = self.member.take() {
            fields.push((FIELD_MEMBER, Value::String(member)));
        }
        if let Some(error_name) = self.error_name.take() {
            fields.push((FIELD_ERROR_NAME, Value::String(error_name)));
        }
        if let Some(reply_serial) = self.reply_serial {
            fields.push((FIELD_REPLY_SERIAL, Value::Uint32(reply_serial)));
        }
        if let Some(destination) = self.destination.take() {
            fields.push((FIELD_DESTINATION, Value::String(destination)));
        }
        if let Some(sender) = self.sender.take() {
            fields.push((FIELD_SENDER, Value::String(sender)));
        }
        if !signature.is_empty() {
            fields.push((FIELD_SIGNATURE, Value::Signature(signature)));
        }
        if !body.fds.is_empty() {
            fields.push((FIELD_UNIX_FDS, Value::Uint32(body.fds.len() as u32)));
        }

        let field_values = fields
            .into_iter()
            .map(|(code, value)| {
                Value::Struct(vec![Value::Byte(code), Value::Variant(Box::new(value))])
            })
            .collect();

        let mut wire = EncodeBuf::new();
        wire.put_u8(Endian::native().marker());
        wire.put_u8(self.kind.as_byte());
        wire.put_u8(self.flags);
        wire.put_u8(PROTOCOL_VERSION);
        wire.put_u32(body.data.len() as u32);
        wire.put_u32(serial);
        encode_value(
            Value::Array(Signature::from_validated("(yv)".into()), field_values),
            &mut wire,
        )?;
        wire.pad(8);
        wire.data.extend_from_slice(&body.data);

        if wire.data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::SendFailure(format!(
                "message of {} bytes exceeds the protocol limit",
                wire.data.len()
            )));
        }

        Ok((wire.data, body.fds))
    }

    /// Unmarshal one complete frame. `fd_pool` holds the descriptors that
    /// arrived as ancillary data; the frame takes the number its header
    /// declares, in arrival order.
    pub fn from_wire(data: &[u8], fd_pool: &mut Vec<OwnedFd>) -> Result<Self> {
        if data.len() < 16 {
            return Err(Error::MalformedMessage("frame shorter than a header".into()));
        }
        let endian = Endian::from_marker(data[0])?;

        let mut nothing = Vec::new();
        let mut buf = DecodeBuf::new(data, endian, &mut nothing);

        let _marker = buf.get_u8()?;
        let kind = MessageKind::from_byte(buf.get_u8()?);
        let flags = buf.get_u8()?;
        let version = buf.get_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(Error::MalformedMessage(format!(
                "unsupported protocol version {version}"
            )));
        }

        let body_len = buf.get_u32()? as usize;
        let serial = buf.get_u32()?;
        if serial == 0 {
            return Err(Error::MalformedMessage("message serial is zero".into()));
        }

        let fields = decode_value(&mut buf, "a(yv)")?;
        buf.pad(8)?;

        let mut msg = Message {
            kind,
            serial,
            flags,
            ..Default::default()
        };

        let mut signature = Signature::empty();
        let mut fd_count = 0usize;

        let Value::Array(_, field_values) = fields else {
            unreachable!("header fields decoded against a(yv)")
        };
        for field in field_values {
            let Value::Struct(mut parts) = field else {
                continue;
            };
            let (Some(Value::Variant(value)), Some(Value::Byte(code))) =
                (parts.pop(), parts.pop())
            else {
                return Err(Error::MalformedMessage("malformed header field".into()));
            };

            match (code, *value) {
                (FIELD_PATH, Value::ObjectPath(path)) => msg.path = Some(path),
                (FIELD_INTERFACE, Value::String(s)) => msg.interface = Some(s),
                (FIELD_MEMBER, Value::String(s)) => msg.member = Some(s),
                (FIELD_ERROR_NAME, Value::String(s)) => msg.error_name = Some(s),
                (FIELD_REPLY_SERIAL, Value::Uint32(serial)) => msg.reply_serial = Some(serial),
                (FIELD_DESTINATION, Value::String(s)) => msg.destination = Some(s),
                (FIELD_SENDER, Value::String(s)) => msg.sender = Some(s),
                (FIELD_SIGNATURE, Value::Signature(sig)) => signature = sig,
                (FIELD_UNIX_FDS, Value::Uint32(count)) => fd_count = count as usize,
                (FIELD_PATH..=FIELD_UNIX_FDS, _) => {
                    return Err(Error::MalformedMessage(format!(
                        "header field {code} carries the wrong type"
                    )))
                }
                // unknown fields are skipped for forward compatibility
                _ => {}
            }
        }

        if fd_pool.len() < fd_count {
            return Err(Error::MalformedMessage(format!(
                "message declares {fd_count} descriptors, {} arrived",
                fd_pool.len()
            )));
        }
        let mut fds: Vec<Option<OwnedFd>> = fd_pool.drain(..fd_count).map(Some).collect();

        let body_start = {
            // reconstruct the cursor with the descriptor pool attached
            let pos = buf.position();
            drop(buf);
            pos
        };
        let mut buf = DecodeBuf::new(data, endian, &mut fds);
        buf.take(body_start)?;

        for complete in signature.complete_types() {
            msg.args.push(decode_value(&mut buf, complete)?);
        }

        if buf.position() - body_start != body_len {
            return Err(Error::MalformedMessage(
                "body length disagrees with the decoded arguments".into(),
            ));
        }

        if msg.kind != MessageKind::Invalid && !msg.required_headers_present() {
            return Err(Error::MalformedMessage(format!(
                "message of kind {:?} is missing required headers",
                msg.kind
            )));
        }

        Ok(msg)
    }
}

/// Result of trying to cut one frame out of the stream buffer.
pub enum EitherFrame {
    Full(Message),
    NeedMoreData(usize),
}

/// Try to parse a frame from the reassembly buffer.
///
/// Returns the frame and consumes its bytes, or the number of bytes still
/// missing. Descriptors received as ancillary data are taken from
/// `fd_pool` by the frames that declare them.
pub fn parse_buffer(buffer: &mut BytesMut, fd_pool: &mut Vec<OwnedFd>) -> Result<EitherFrame> {
    // fixed header part plus the field-array length
    if buffer.len() < 16 {
        return Ok(EitherFrame::NeedMoreData(16 - buffer.len()));
    }

    let endian = Endian::from_marker(buffer[0])?;
    let read_u32 = |bytes: &[u8]| -> u32 {
        let bytes = bytes.try_into().unwrap();
        match endian {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        }
    };

    let body_len = read_u32(&buffer[4..8]) as usize;
    let fields_len = read_u32(&buffer[12..16]) as usize;
    let header_end = (16 + fields_len + 7) & !7;
    let total = header_end + body_len;

    if total > MAX_MESSAGE_SIZE {
        return Err(Error::MalformedMessage(format!(
            "peer announced a frame of {total} bytes"
        )));
    }

    if buffer.len() < total {
        return Ok(EitherFrame::NeedMoreData(total - buffer.len()));
    }

    trace!("Incoming frame of {} bytes", total);

    let msg = Message::from_wire(&buffer[..total], fd_pool)?;
    buffer.advance(total);

    Ok(EitherFrame::Full(msg))
}

enum Container {
    Struct(Vec<Value>),
    Array(Signature, Vec<Value>),
    DictEntry(Signature, Vec<Value>),
    Variant(Signature, Vec<Value>),
}

/// Write cursor appending typed arguments to a message under construction.
/// Containers open and close in LIFO order; every open requires exactly
/// one close on the same level.
pub struct Writer<'m> {
    msg: &'m mut Message,
    stack: Vec<Container>,
}

impl Writer<'_> {
    pub fn append<T: BusType>(&mut self, value: T) -> Result<()> {
        self.push_value(value.into_value())
    }

    /// Append a raw dynamic value.
    pub fn push_value(&mut self, value: Value) -> Result<()> {
        match self.stack.last_mut() {
            None => {
                self.msg.args.push(value);
                Ok(())
            }
            Some(Container::Struct(items)) => {
                items.push(value);
                Ok(())
            }
            Some(Container::Array(elem, items)) => {
                let actual = value.signature();
                if &actual != elem {
                    return Err(Error::TypeMismatch {
                        expected: elem.as_str().as_bytes()[0] as char,
                        actual: value.type_code(),
                    });
                }
                items.push(value);
                Ok(())
            }
            Some(Container::DictEntry(elem, items)) => {
                let inner = &elem.as_str()[1..elem.as_str().len() - 1];
                let (key_sig, value_sig) =
                    split_first_complete(inner).expect("dict element signature was validated");

                let expected = match items.len() {
                    0 => key_sig,
                    1 => value_sig,
                    _ => {
                        return Err(Error::MalformedMessage(
                            "a dict entry holds exactly one key and one value".into(),
                        ))
                    }
                };

                if value.signature().as_str() != expected {
                    return Err(Error::TypeMismatch {
                        expected: expected.as_bytes()[0] as char,
                        actual: value.type_code(),
                    });
                }
                items.push(value);
                Ok(())
            }
            Some(Container::Variant(sig, items)) => {
                if !items.is_empty() {
                    return Err(Error::MalformedMessage(
                        "a variant holds exactly one value".into(),
                    ));
                }
                if &value.signature() != sig {
                    return Err(Error::TypeMismatch {
                        expected: sig.as_str().as_bytes()[0] as char,
                        actual: value.type_code(),
                    });
                }
                items.push(value);
                Ok(())
            }
        }
    }

    pub fn open_struct(&mut self) {
        self.stack.push(Container::Struct(Vec::new()));
    }

    pub fn open_array(&mut self, element: Signature) -> Result<()> {
        if !element.is_single_complete_type() {
            return Err(Error::InvalidSignature(element.as_str().into()));
        }
        self.stack.push(Container::Array(element, Vec::new()));
        Ok(())
    }

    /// Open a dict entry inside an array whose element type is `{..}`.
    pub fn open_dict_entry(&mut self) -> Result<()> {
        let elem = match self.stack.last() {
            Some(Container::Array(elem, _)) if elem.as_str().starts_with('{') => elem.clone(),
            _ => {
                return Err(Error::MalformedMessage(
                    "dict entries only open inside a dict-typed array".into(),
                ))
            }
        };
        self.stack.push(Container::DictEntry(elem, Vec::new()));
        Ok(())
    }

    /// Open a variant for a value of the given single complete type.
    pub fn open_variant(&mut self, inner: Signature) -> Result<()> {
        if !inner.is_single_complete_type() {
            return Err(Error::InvalidSignature(inner.as_str().into()));
        }
        self.stack.push(Container::Variant(inner, Vec::new()));
        Ok(())
    }

    pub fn close_container(&mut self) -> Result<()> {
        let container = self.stack.pop().ok_or_else(|| {
            Error::MalformedMessage("close without a matching open".into())
        })?;

        let value = match container {
            Container::Struct(items) => {
                if items.is_empty() {
                    return Err(Error::InvalidSignature("()".into()));
                }
                Value::Struct(items)
            }
            Container::Array(elem, items) => Value::Array(elem, items),
            Container::DictEntry(_, mut items) => {
                if items.len() != 2 {
                    return Err(Error::MalformedMessage(
                        "a dict entry holds exactly one key and one value".into(),
                    ));
                }
                let value = items.pop().unwrap();
                let key = items.pop().unwrap();
                Value::DictEntry(Box::new(key), Box::new(value))
            }
            Container::Variant(_, mut items) => match items.pop() {
                Some(inner) => Value::Variant(Box::new(inner)),
                None => {
                    return Err(Error::MalformedMessage(
                        "a variant holds exactly one value".into(),
                    ))
                }
            },
        };

        self.push_value(value)
    }
}

impl Drop for Writer<'_> {
    fn drop(&mut self) {
        if !self.stack.is_empty() {
            // arguments of half-built containers never reach the message
            trace!("Writer dropped with {} open containers", self.stack.len());
        }
    }
}

/// Read cursor over a message's arguments. Pops advance; [`Reader::peek`]
/// does not. A pop against the wrong type fails without advancing.
pub struct Reader {
    values: std::vec::IntoIter<Value>,
}

impl Reader {
    fn new(values: Vec<Value>) -> Self {
        Self {
            values: values.into_iter(),
        }
    }

    /// Type code of the current argument, if any.
    pub fn peek(&self) -> Option<char> {
        self.values.as_slice().first().map(Value::type_code)
    }

    pub fn has_next(&self) -> bool {
        !self.values.as_slice().is_empty()
    }

    /// Skip the current argument regardless of type.
    pub fn skip(&mut self) -> Result<()> {
        self.pop_value().map(drop)
    }

    pub fn pop_value(&mut self) -> Result<Value> {
        self.values
            .next()
            .ok_or_else(|| Error::MalformedMessage("no more arguments to read".into()))
    }

    fn pop_checked(&mut self, expected: char) -> Result<Value> {
        match self.peek() {
            None => Err(Error::MalformedMessage("no more arguments to read".into())),
            Some(actual) if actual == expected => self.pop_value(),
            Some(actual) => Err(Error::TypeMismatch { expected, actual }),
        }
    }

    /// Pop the current argument as `T`, failing with a type mismatch if it
    /// is something else.
    pub fn pop<T: BusType>(&mut self) -> Result<T> {
        let expected = T::signature().as_str().as_bytes()[0] as char;
        match self.peek() {
            None => Err(Error::MalformedMessage("no more arguments to read".into())),
            Some(actual) if actual == expected => T::from_value(self.pop_value()?),
            Some(actual) => Err(Error::TypeMismatch { expected, actual }),
        }
    }

    /// Recurse into the current argument, which must be an array. The
    /// returned cursor iterates the elements.
    pub fn pop_array(&mut self) -> Result<Reader> {
        match self.pop_checked('a')? {
            Value::Array(_, items) => Ok(Reader::new(items)),
            _ => unreachable!(),
        }
    }

    pub fn pop_struct(&mut self) -> Result<Reader> {
        match self.pop_checked('r')? {
            Value::Struct(fields) => Ok(Reader::new(fields)),
            _ => unreachable!(),
        }
    }

    pub fn pop_dict_entry(&mut self) -> Result<Reader> {
        match self.pop_checked('e')? {
            Value::DictEntry(key, value) => Ok(Reader::new(vec![*key, *value])),
            _ => unreachable!(),
        }
    }

    pub fn pop_variant(&mut self) -> Result<Reader> {
        match self.pop_checked('v')? {
            Value::Variant(inner) => Ok(Reader::new(vec![*inner])),
            _ => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UnixFd;

    #[test]
    fn method_call_round_trips_the_wire() {
        let mut msg =
            Message::method_call("org.test.Target", "/org/test", "org.test.Iface", "Do").unwrap();
        msg.write_args((42u32, "payload".to_string())).unwrap();

        let (bytes, fds) = msg.to_wire(7).unwrap();
        assert!(fds.is_empty());

        let mut buffer = BytesMut::from(bytes.as_slice());
        let mut pool = Vec::new();
        let mut decoded = match parse_buffer(&mut buffer, &mut pool).unwrap() {
            EitherFrame::Full(msg) => msg,
            EitherFrame::NeedMoreData(_) => panic!("frame was complete"),
        };
        assert!(buffer.is_empty());

        assert_eq!(decoded.kind(), MessageKind::MethodCall);
        assert_eq!(decoded.serial(), 7);
        assert_eq!(decoded.path().unwrap().as_str(), "/org/test");
        assert_eq!(decoded.interface(), Some("org.test.Iface"));
        assert_eq!(decoded.member(), Some("Do"));
        assert_eq!(decoded.destination(), Some("org.test.Target"));
        assert_eq!(decoded.signature().as_str(), "us");

        let (num, text) = decoded.read_args::<(u32, String)>().unwrap();
        assert_eq!((num, text.as_str()), (42, "payload"));
    }

    #[test]
    fn partial_frames_report_missing_bytes() {
        let mut msg = Message::signal("/", "org.test.Iface", "Changed").unwrap();
        msg.write_args((1u8,)).unwrap();
        let (bytes, _) = msg.to_wire(1).unwrap();

        let mut pool = Vec::new();

        let mut buffer = BytesMut::from(&bytes[..10]);
        match parse_buffer(&mut buffer, &mut pool).unwrap() {
            EitherFrame::NeedMoreData(n) => assert_eq!(n, 6),
            EitherFrame::Full(_) => panic!("frame cannot be complete yet"),
        }

        let mut buffer = BytesMut::from(&bytes[..bytes.len() - 1]);
        match parse_buffer(&mut buffer, &mut pool).unwrap() {
            EitherFrame::NeedMoreData(n) => assert_eq!(n, 1),
            EitherFrame::Full(_) => panic!("frame cannot be complete yet"),
        }
    }

    #[test]
    fn reply_links_to_the_call() {
        let mut call =
            Message::method_call("org.test.Target", "/", "org.test.Iface", "Do").unwrap();
        call.set_serial(99);
        call.sender = Some(":1.7".into());

        let reply = Message::method_return(&call);
        assert_eq!(reply.reply_serial(), Some(99));
        assert_eq!(reply.destination(), Some(":1.7"));

        let err = Message::error(&call, "org.test.Error.Boom", "went boom").unwrap();
        assert_eq!(err.reply_serial(), Some(99));
        assert_eq!(err.error_name(), Some("org.test.Error.Boom"));
    }

    #[test]
    fn writer_enforces_container_discipline() {
        let mut msg = Message::signal("/", "org.test.Iface", "S").unwrap();
        let mut writer = msg.writer();

        // variants take exactly one complete type
        assert!(matches!(
            writer.open_variant(Signature::new("uu").unwrap()),
            Err(Error::InvalidSignature(_))
        ));

        writer.open_array(Signature::new("u").unwrap()).unwrap();
        let err = writer.append("oops".to_string()).unwrap_err();
        assert_eq!(
            err,
            Error::TypeMismatch {
                expected: 'u',
                actual: 's'
            }
        );
        writer.append(5u32).unwrap();
        writer.close_container().unwrap();

        assert!(writer.close_container().is_err());
        drop(writer);

        assert_eq!(msg.signature().as_str(), "au");
    }

    #[test]
    fn reader_mismatch_does_not_advance() {
        let mut msg = Message::signal("/", "org.test.Iface", "S").unwrap();
        msg.write_args((7u32,)).unwrap();

        let mut reader = msg.reader();
        assert_eq!(reader.peek(), Some('u'));
        assert_eq!(
            reader.pop::<String>().unwrap_err(),
            Error::TypeMismatch {
                expected: 's',
                actual: 'u'
            }
        );
        // the argument is still there
        assert_eq!(reader.pop::<u32>().unwrap(), 7);
        assert!(!reader.has_next());
    }

    #[test]
    fn fds_transfer_ownership_on_decode() {
        use std::os::fd::AsRawFd;

        let (left, _right) = std::os::unix::net::UnixStream::pair().unwrap();
        let raw = left.as_raw_fd();

        let mut msg =
            Message::method_call("org.test.Target", "/", "org.test.Iface", "Take").unwrap();
        msg.write_args((UnixFd::new(left.into()),)).unwrap();

        let (bytes, mut fds) = msg.to_wire(3).unwrap();
        assert_eq!(fds.len(), 1);
        assert_eq!(fds[0].as_raw_fd(), raw);

        let mut decoded = Message::from_wire(&bytes, &mut fds).unwrap();
        assert!(fds.is_empty());

        let (mut fd,) = decoded.read_args::<(UnixFd,)>().unwrap();
        let owned = fd.take().expect("descriptor owned by the decoded value");
        assert_eq!(owned.as_raw_fd(), raw);
        assert!(fd.take().is_none());
    }
}
