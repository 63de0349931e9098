use std::convert::TryFrom;
use std::fmt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use zvariant::{ObjectPath, Signature};

use crate::kernel::PoolSlot;
use crate::utils::{dbus_context, padding_for_8_bytes};
use crate::{
    Error, MessageField, MessageFields, MessageHeader, MessagePrimaryHeader, MessageType,
    OwnedFd, Result, MessageFlags, MIN_MESSAGE_SIZE,
};

/// File descriptors attached to a message.
///
/// Descriptors received from the transport are owned by the message and closed
/// with it, unless the caller takes them over with [`Message::disown_fds`].
#[derive(Debug)]
enum Fds {
    Owned(Vec<OwnedFd>),
    Raw(Vec<RawFd>),
}

impl Fds {
    fn raw(&self) -> Vec<RawFd> {
        match self {
            Fds::Owned(fds) => fds.iter().map(|f| f.as_raw_fd()).collect(),
            Fds::Raw(fds) => fds.clone(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Fds::Owned(fds) => fds.len(),
            Fds::Raw(fds) => fds.len(),
        }
    }
}

/// A D-Bus message.
///
/// The message owns its serialized form (and any attached file descriptors);
/// header fields are deserialized on demand. Typed bodies are marshalled and
/// unmarshalled through [`zvariant`] at the constructor/[`body`] seam; the
/// connection core itself only ever touches the header.
///
/// A message becomes *sealed* when the connection assigns its serial number on
/// send; a sealed message cannot be modified or sent again.
///
/// [`body`]: struct.Message.html#method.body
pub struct Message {
    bytes: Vec<u8>,
    fds: Fds,
    // Keeps the kernel pool slot allocated for as long as this message lives.
    pool_slot: Option<PoolSlot>,
}

impl Message {
    /// Create a method call message.
    pub fn method<B>(
        sender: Option<&str>,
        destination: Option<&str>,
        path: &str,
        iface: Option<&str>,
        method_name: &str,
        body: &B,
    ) -> Result<Self>
    where
        B: serde::ser::Serialize + zvariant::Type,
    {
        Self::build(
            MessageType::MethodCall,
            sender,
            destination,
            Some(path),
            iface,
            Some(method_name),
            None,
            None,
            body,
        )
    }

    /// Create a signal message.
    pub fn signal<B>(
        sender: Option<&str>,
        destination: Option<&str>,
        path: &str,
        iface: &str,
        signal_name: &str,
        body: &B,
    ) -> Result<Self>
    where
        B: serde::ser::Serialize + zvariant::Type,
    {
        Self::build(
            MessageType::Signal,
            sender,
            destination,
            Some(path),
            Some(iface),
            Some(signal_name),
            None,
            None,
            body,
        )
    }

    /// Create a method reply to `call`.
    pub fn method_reply<B>(sender: Option<&str>, call: &Self, body: &B) -> Result<Self>
    where
        B: serde::ser::Serialize + zvariant::Type,
    {
        let header = call.header()?;
        Self::build(
            MessageType::MethodReturn,
            sender,
            header.sender()?,
            None,
            None,
            None,
            None,
            Some(header.serial()),
            body,
        )
    }

    /// Create an error reply to `call` with the given error name.
    pub fn method_error<B>(
        sender: Option<&str>,
        call: &Self,
        name: &str,
        body: &B,
    ) -> Result<Self>
    where
        B: serde::ser::Serialize + zvariant::Type,
    {
        let header = call.header()?;
        Self::build(
            MessageType::Error,
            sender,
            header.sender()?,
            None,
            None,
            None,
            Some(name),
            Some(header.serial()),
            body,
        )
    }

    /// Create an error message for a call known only by serial, such as the
    /// synthetic reply delivered when a method call times out.
    pub(crate) fn error_for_serial(
        reply_serial: u32,
        destination: Option<&str>,
        name: &str,
        text: &str,
    ) -> Result<Self> {
        Self::build(
            MessageType::Error,
            None,
            destination,
            None,
            None,
            None,
            Some(name),
            Some(reply_serial),
            &text,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build<B>(
        msg_type: MessageType,
        sender: Option<&str>,
        destination: Option<&str>,
        path: Option<&str>,
        iface: Option<&str>,
        member: Option<&str>,
        error_name: Option<&str>,
        reply_serial: Option<u32>,
        body: &B,
    ) -> Result<Self>
    where
        B: serde::ser::Serialize + zvariant::Type,
    {
        let ctxt = dbus_context(0);
        let (body_bytes, body_fds) = zvariant::to_bytes_fds(ctxt, body)?;

        // Multi-argument bodies serialize as a struct; the body signature on
        // the wire is the flattened sequence without the outer parentheses.
        let body_sig = {
            let sig = B::signature();
            let sig = sig.as_str();
            if sig.starts_with('(') && sig.ends_with(')') {
                sig[1..sig.len() - 1].to_string()
            } else {
                sig.to_string()
            }
        };

        let mut fields = MessageFields::new();
        if let Some(path) = path {
            fields.add(MessageField::path(ObjectPath::try_from(path)?));
        }
        if let Some(iface) = iface {
            fields.add(MessageField::interface(iface));
        }
        if let Some(member) = member {
            fields.add(MessageField::member(member));
        }
        if let Some(name) = error_name {
            fields.add(MessageField::error_name(name));
        }
        if let Some(serial) = reply_serial {
            fields.add(MessageField::reply_serial(serial));
        }
        if let Some(destination) = destination {
            fields.add(MessageField::destination(destination));
        }
        if let Some(sender) = sender {
            fields.add(MessageField::sender(sender));
        }
        if !body_sig.is_empty() {
            fields.add(MessageField::signature(Signature::try_from(
                body_sig.as_str(),
            )?));
        }
        if !body_fds.is_empty() {
            fields.add(MessageField::unix_fds(body_fds.len() as u32));
        }

        let primary = MessagePrimaryHeader::new(msg_type, body_bytes.len() as u32);
        let header = MessageHeader::new(primary, fields);

        let mut bytes = zvariant::to_bytes(ctxt, &header)?;
        let padding = padding_for_8_bytes(bytes.len());
        bytes.extend(std::iter::repeat(0u8).take(padding));
        bytes.extend(&body_bytes);

        Ok(Self {
            bytes,
            fds: Fds::Raw(body_fds),
            pool_slot: None,
        })
    }

    /// Reconstruct a message from the serialized form and the descriptors that
    /// arrived with it.
    pub(crate) fn from_raw_parts(bytes: Vec<u8>, fds: Vec<OwnedFd>) -> Result<Self> {
        // Validates the endianness marker and the protocol version.
        MessagePrimaryHeader::read(&bytes)?;

        Ok(Self {
            bytes,
            fds: Fds::Owned(fds),
            pool_slot: None,
        })
    }

    /// Like [`from_raw_parts`], for messages borrowed from the kernel receive
    /// pool: the slot stays allocated until this message is dropped.
    ///
    /// [`from_raw_parts`]: struct.Message.html#method.from_raw_parts
    pub(crate) fn from_pool(bytes: Vec<u8>, fds: Vec<OwnedFd>, slot: PoolSlot) -> Result<Self> {
        let mut msg = Self::from_raw_parts(bytes, fds)?;
        msg.pool_slot = Some(slot);
        Ok(msg)
    }

    /// The fixed part of the header.
    pub fn primary_header(&self) -> Result<MessagePrimaryHeader> {
        zvariant::from_slice(&self.bytes[..crate::PRIMARY_HEADER_SIZE], dbus_context(0))
            .map_err(Error::Variant)
    }

    /// Modify the fixed part of the header in place.
    ///
    /// Fails on sealed messages for mutations the connection does not perform
    /// itself; external callers should not normally need this.
    pub fn modify_primary_header<F>(&mut self, mut modifier: F) -> Result<()>
    where
        F: FnMut(&mut MessagePrimaryHeader) -> Result<()>,
    {
        let mut primary = self.primary_header()?;
        modifier(&mut primary)?;

        let patched = zvariant::to_bytes(dbus_context(0), &primary)?;
        self.bytes[..crate::PRIMARY_HEADER_SIZE].copy_from_slice(&patched);

        Ok(())
    }

    /// The full header, deserialized from the wire form.
    pub fn header(&self) -> Result<MessageHeader<'_>> {
        let len = self.header_len()?;
        zvariant::from_slice(&self.bytes[..len], dbus_context(0)).map_err(Error::Variant)
    }

    /// The message type.
    pub fn message_type(&self) -> Result<MessageType> {
        Ok(self.primary_header()?.msg_type())
    }

    /// Whether a serial number has been assigned (the message has been given
    /// to a connection for sending).
    pub fn is_sealed(&self) -> bool {
        self.primary_header()
            .map(|h| h.serial_num() != 0)
            .unwrap_or(false)
    }

    /// Assign the serial number, sealing the message.
    pub(crate) fn seal(&mut self, serial: u32) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::Protocol("message is already sealed".into()));
        }

        self.modify_primary_header(|primary| {
            primary.set_serial_num(serial);
            Ok(())
        })
    }

    /// Set the `NoReplyExpected` flag. Only valid before sealing.
    pub(crate) fn set_no_reply_expected(&mut self) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::Protocol("message is already sealed".into()));
        }

        self.modify_primary_header(|primary| {
            primary.set_flags(primary.flags() | MessageFlags::NoReplyExpected);
            Ok(())
        })
    }

    /// The signature of the body, if the message carries one.
    pub fn body_signature(&self) -> Result<Option<String>> {
        Ok(self.header()?.signature()?.map(String::from))
    }

    /// Deserialize the body into `B`.
    pub fn body<'d, B>(&'d self) -> Result<B>
    where
        B: serde::de::Deserialize<'d> + zvariant::Type,
    {
        let offset = self.body_offset()?;
        let fds = self.fds.raw();
        zvariant::from_slice_fds(&self.bytes[offset..], Some(&fds), dbus_context(0))
            .map_err(Error::Variant)
    }

    /// The raw serialized form.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The attached file descriptors.
    pub fn fds(&self) -> Vec<RawFd> {
        self.fds.raw()
    }

    /// Number of attached file descriptors.
    pub fn fd_count(&self) -> usize {
        self.fds.len()
    }

    /// Give up ownership of the attached descriptors: they will no longer be
    /// closed when the message is dropped.
    pub fn disown_fds(&mut self) {
        if let Fds::Owned(owned) = &mut self.fds {
            let raw = std::mem::replace(owned, vec![])
                .into_iter()
                .map(|f| f.into_raw_fd())
                .collect();
            self.fds = Fds::Raw(raw);
        }
    }

    fn header_len(&self) -> Result<usize> {
        let (_, fields_len) = MessagePrimaryHeader::read(&self.bytes)?;
        Ok(MIN_MESSAGE_SIZE + fields_len as usize)
    }

    fn body_offset(&self) -> Result<usize> {
        let header_len = self.header_len()?;
        Ok(header_len + padding_for_8_bytes(header_len))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Message");
        if let Ok(primary) = self.primary_header() {
            s.field("type", &primary.msg_type())
                .field("serial", &primary.serial_num())
                .field("body_len", &primary.body_len());
        }
        s.field("fds", &self.fds.len())
            .field("pool", &self.pool_slot.is_some())
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        let (msg_type, member, error_name) = match &header {
            Ok(h) => (
                h.message_type().ok(),
                h.member().unwrap_or(None),
                h.error_name().unwrap_or(None),
            ),
            Err(_) => (None, None, None),
        };

        match msg_type {
            Some(MessageType::MethodCall) => {
                write!(f, "Method call {}", member.unwrap_or(""))
            }
            Some(MessageType::MethodReturn) => write!(f, "Method return"),
            Some(MessageType::Error) => write!(f, "Error {}", error_name.unwrap_or("")),
            Some(MessageType::Signal) => write!(f, "Signal {}", member.unwrap_or("")),
            None => write!(f, "Invalid message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Message;
    use crate::{MessageFlags, MessageType};
    use enumflags2::BitFlags;

    #[test]
    fn build_and_inspect() {
        let mut m = Message::method(
            None,
            Some("org.freedesktop.DBus"),
            "/org/freedesktop/DBus",
            Some("org.freedesktop.DBus.Peer"),
            "GetMachineId",
            &(),
        )
        .unwrap();
        m.modify_primary_header(|primary| {
            primary.set_flags(BitFlags::from(MessageFlags::NoAutoStart));
            primary.set_serial_num(11);

            Ok(())
        })
        .unwrap();
        let primary = m.primary_header().unwrap();
        assert!(primary.serial_num() == 11);
        assert!(primary.flags() == MessageFlags::NoAutoStart);

        let header = m.header().unwrap();
        assert_eq!(header.path().unwrap(), Some("/org/freedesktop/DBus"));
        assert_eq!(header.interface().unwrap(), Some("org.freedesktop.DBus.Peer"));
        assert_eq!(header.member().unwrap(), Some("GetMachineId"));
        assert_eq!(header.destination().unwrap(), Some("org.freedesktop.DBus"));
        assert_eq!(m.to_string(), "Method call GetMachineId");
    }

    #[test]
    fn body_roundtrip() {
        let m = Message::method(None, None, "/", Some("org.rbus.Test"), "Echo", &("hello", 23u32))
            .unwrap();
        assert_eq!(m.body_signature().unwrap().as_deref(), Some("su"));
        let (s, n): (String, u32) = m.body().unwrap();
        assert_eq!(s, "hello");
        assert_eq!(n, 23);
    }

    #[test]
    fn empty_body() {
        let m = Message::method(None, None, "/", None, "Ping", &()).unwrap();
        assert_eq!(m.body_signature().unwrap(), None);
        let () = m.body().unwrap();
    }

    #[test]
    fn seal_once() {
        let mut m = Message::signal(None, None, "/", "org.rbus.Test", "Fired", &()).unwrap();
        assert!(!m.is_sealed());
        m.seal(1).unwrap();
        assert!(m.is_sealed());
        assert!(m.seal(2).is_err());
    }

    #[test]
    fn reply_correlation() {
        let mut call =
            Message::method(Some(":1.7"), None, "/", Some("org.rbus.Test"), "Frob", &()).unwrap();
        call.seal(42).unwrap();

        let reply = Message::method_reply(None, &call, &("ok")).unwrap();
        let header = reply.header().unwrap();
        assert_eq!(header.message_type().unwrap(), MessageType::MethodReturn);
        assert_eq!(header.reply_serial().unwrap(), Some(42));
        assert_eq!(header.destination().unwrap(), Some(":1.7"));
        assert!(header.is_reply_to(42).unwrap());
    }

    #[test]
    fn synthetic_timeout_error() {
        let m = Message::error_for_serial(9, None, crate::name::NO_REPLY, "timed out").unwrap();
        let header = m.header().unwrap();
        assert_eq!(header.message_type().unwrap(), MessageType::Error);
        assert_eq!(header.reply_serial().unwrap(), Some(9));
        assert_eq!(header.error_name().unwrap(), Some(crate::name::NO_REPLY));
        let text: String = m.body().unwrap();
        assert_eq!(text, "timed out");
    }
}
