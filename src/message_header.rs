use byteorder::{ByteOrder, NativeEndian};
use enumflags2::BitFlags;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use zvariant::derive::Type;
use zvariant::{ObjectPath, Signature, Value};

use crate::utils::dbus_context;
use crate::{Error, Result};

/// Size of the fixed part of a message header.
pub const PRIMARY_HEADER_SIZE: usize = 12;

/// The fixed header plus the length of the header field array: the smallest
/// prefix from which the total size of a message can be computed.
pub const MIN_MESSAGE_SIZE: usize = PRIMARY_HEADER_SIZE + 4;

/// Maximum size of a message, from the D-Bus specification (128 MiB).
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// The protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// The endianness marker at the start of every message.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Serialize_repr, Deserialize_repr, Type)]
pub enum EndianSig {
    Big = b'B',
    Little = b'l',
}

#[cfg(target_endian = "big")]
pub const NATIVE_ENDIAN_SIG: EndianSig = EndianSig::Big;
#[cfg(target_endian = "little")]
pub const NATIVE_ENDIAN_SIG: EndianSig = EndianSig::Little;

/// The type of a message.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Serialize_repr, Deserialize_repr, Type)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

/// Flags in the fixed part of the header.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, BitFlags)]
pub enum MessageFlags {
    /// The sender does not want a reply to this method call.
    NoReplyExpected = 0x1,
    /// Do not launch an owner for the destination name.
    NoAutoStart = 0x2,
    /// The caller is prepared to wait for interactive authorization.
    AllowInteractiveAuth = 0x4,
}

/// The fixed part of a message header.
///
/// The flags byte is kept raw on this struct (peers may set bits we do not
/// know) and exposed as typed [`MessageFlags`] through the accessors.
///
/// [`MessageFlags`]: enum.MessageFlags.html
#[derive(Copy, Clone, Debug, Serialize, Deserialize, Type)]
pub struct MessagePrimaryHeader {
    endian_sig: EndianSig,
    msg_type: MessageType,
    flags: u8,
    protocol_version: u8,
    body_len: u32,
    serial_num: u32,
}

impl MessagePrimaryHeader {
    pub fn new(msg_type: MessageType, body_len: u32) -> Self {
        Self {
            endian_sig: NATIVE_ENDIAN_SIG,
            msg_type,
            flags: 0,
            protocol_version: PROTOCOL_VERSION,
            body_len,
            serial_num: 0,
        }
    }

    /// Peek a serialized message prefix (at least [`MIN_MESSAGE_SIZE`] bytes)
    /// and return the deserialized fixed header together with the length of
    /// the header field array, which is all the framing layer needs to size
    /// the full frame.
    pub fn read(buf: &[u8]) -> Result<(MessagePrimaryHeader, u32)> {
        if buf.len() < MIN_MESSAGE_SIZE {
            return Err(Error::Protocol("truncated message header".into()));
        }
        if buf[0] != NATIVE_ENDIAN_SIG as u8 {
            return Err(Error::Protocol(format!(
                "unexpected endianness marker: {:#x}",
                buf[0]
            )));
        }

        let primary: MessagePrimaryHeader =
            zvariant::from_slice(&buf[..PRIMARY_HEADER_SIZE], dbus_context(0))?;
        if primary.protocol_version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported protocol version: {}",
                primary.protocol_version
            )));
        }

        let fields_len = NativeEndian::read_u32(&buf[PRIMARY_HEADER_SIZE..MIN_MESSAGE_SIZE]);

        Ok((primary, fields_len))
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn flags(&self) -> BitFlags<MessageFlags> {
        BitFlags::from_bits_truncate(self.flags)
    }

    pub fn set_flags(&mut self, flags: BitFlags<MessageFlags>) {
        self.flags = flags.bits();
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn body_len(&self) -> u32 {
        self.body_len
    }

    pub fn serial_num(&self) -> u32 {
        self.serial_num
    }

    pub fn set_serial_num(&mut self, serial: u32) {
        self.serial_num = serial;
    }
}

/// The code identifying a header field.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Serialize_repr, Deserialize_repr, Type)]
pub enum MessageFieldCode {
    Invalid = 0,
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

/// One header field: a code and a variant-typed value.
#[derive(Clone, Debug, Serialize, Deserialize, Type)]
pub struct MessageField<'v>(MessageFieldCode, #[serde(borrow)] Value<'v>);

impl<'v> MessageField<'v> {
    pub fn code(&self) -> MessageFieldCode {
        self.0
    }

    pub fn value(&self) -> &Value<'v> {
        &self.1
    }

    pub fn path(path: ObjectPath<'v>) -> Self {
        Self(MessageFieldCode::Path, Value::ObjectPath(path))
    }

    pub fn interface(interface: &'v str) -> Self {
        Self(MessageFieldCode::Interface, Value::from(interface))
    }

    pub fn member(member: &'v str) -> Self {
        Self(MessageFieldCode::Member, Value::from(member))
    }

    pub fn error_name(name: &'v str) -> Self {
        Self(MessageFieldCode::ErrorName, Value::from(name))
    }

    pub fn reply_serial(serial: u32) -> Self {
        Self(MessageFieldCode::ReplySerial, Value::from(serial))
    }

    pub fn destination(destination: &'v str) -> Self {
        Self(MessageFieldCode::Destination, Value::from(destination))
    }

    pub fn sender(sender: &'v str) -> Self {
        Self(MessageFieldCode::Sender, Value::from(sender))
    }

    pub fn signature(signature: Signature<'v>) -> Self {
        Self(MessageFieldCode::Signature, Value::Signature(signature))
    }

    pub fn unix_fds(count: u32) -> Self {
        Self(MessageFieldCode::UnixFds, Value::from(count))
    }
}

/// The header field array.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Type)]
pub struct MessageFields<'v>(#[serde(borrow)] Vec<MessageField<'v>>);

impl<'v> MessageFields<'v> {
    pub fn new() -> Self {
        Self(vec![])
    }

    pub fn add(&mut self, field: MessageField<'v>) {
        self.0.push(field);
    }

    pub fn get(&self, code: MessageFieldCode) -> Option<&MessageField<'v>> {
        self.0.iter().find(|f| f.code() == code)
    }
}

/// A deserialized message header: the fixed part plus the field array.
#[derive(Clone, Debug, Serialize, Deserialize, Type)]
pub struct MessageHeader<'v> {
    primary: MessagePrimaryHeader,
    #[serde(borrow)]
    fields: MessageFields<'v>,
}

impl<'v> MessageHeader<'v> {
    pub fn new(primary: MessagePrimaryHeader, fields: MessageFields<'v>) -> Self {
        Self { primary, fields }
    }

    pub fn primary(&self) -> &MessagePrimaryHeader {
        &self.primary
    }

    pub fn message_type(&self) -> Result<MessageType> {
        Ok(self.primary.msg_type())
    }

    pub fn flags(&self) -> BitFlags<MessageFlags> {
        self.primary.flags()
    }

    pub fn serial(&self) -> u32 {
        self.primary.serial_num()
    }

    pub fn path(&self) -> Result<Option<&str>> {
        self.field_str(MessageFieldCode::Path)
    }

    pub fn interface(&self) -> Result<Option<&str>> {
        self.field_str(MessageFieldCode::Interface)
    }

    pub fn member(&self) -> Result<Option<&str>> {
        self.field_str(MessageFieldCode::Member)
    }

    pub fn error_name(&self) -> Result<Option<&str>> {
        self.field_str(MessageFieldCode::ErrorName)
    }

    pub fn destination(&self) -> Result<Option<&str>> {
        self.field_str(MessageFieldCode::Destination)
    }

    pub fn sender(&self) -> Result<Option<&str>> {
        self.field_str(MessageFieldCode::Sender)
    }

    pub fn signature(&self) -> Result<Option<&str>> {
        match self.fields.get(MessageFieldCode::Signature).map(|f| f.value()) {
            None => Ok(None),
            Some(Value::Signature(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(Error::InvalidField),
        }
    }

    pub fn reply_serial(&self) -> Result<Option<u32>> {
        self.field_u32(MessageFieldCode::ReplySerial)
    }

    pub fn unix_fds(&self) -> Result<Option<u32>> {
        self.field_u32(MessageFieldCode::UnixFds)
    }

    /// Whether this message is a reply (method return or error) to the call
    /// with the given serial.
    pub fn is_reply_to(&self, serial: u32) -> Result<bool> {
        let replyish = match self.primary.msg_type() {
            MessageType::MethodReturn | MessageType::Error => true,
            _ => false,
        };

        Ok(replyish && self.reply_serial()? == Some(serial))
    }

    fn field_str(&self, code: MessageFieldCode) -> Result<Option<&str>> {
        match self.fields.get(code).map(|f| f.value()) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.as_str())),
            Some(Value::ObjectPath(p)) => Ok(Some(p.as_str())),
            Some(_) => Err(Error::InvalidField),
        }
    }

    fn field_u32(&self, code: MessageFieldCode) -> Result<Option<u32>> {
        match self.fields.get(code).map(|f| f.value()) {
            None => Ok(None),
            Some(Value::U32(u)) => Ok(Some(*u)),
            Some(_) => Err(Error::InvalidField),
        }
    }
}
