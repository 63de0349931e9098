use crate::{Message, MessageType, Result};

/// A structured match expression.
///
/// Every field left unset matches anything; a rule with all fields unset
/// matches every message. The textual `key='value'` match syntax of the bus
/// is a separate concern; by the time a rule reaches this crate it is a
/// typed value, built with the chainable setters:
///
/// ```rust
/// use rbus::{MatchRule, MessageType};
///
/// let rule = MatchRule::new()
///     .msg_type(MessageType::Signal)
///     .interface("org.freedesktop.DBus")
///     .member("NameOwnerChanged");
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatchRule {
    msg_type: Option<MessageType>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    destination: Option<String>,
    arg0: Option<String>,
}

impl MatchRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn msg_type(mut self, msg_type: MessageType) -> Self {
        self.msg_type = Some(msg_type);
        self
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_string());
        self
    }

    pub fn member(mut self, member: &str) -> Self {
        self.member = Some(member.to_string());
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    /// Match on the first body argument. Only messages whose body is a single
    /// string can match an `arg0` rule.
    pub fn arg0(mut self, arg0: &str) -> Self {
        self.arg0 = Some(arg0.to_string());
        self
    }

    /// Whether `msg` satisfies every set field of this rule.
    pub fn matches(&self, msg: &Message) -> Result<bool> {
        let header = msg.header()?;

        if let Some(t) = self.msg_type {
            if header.message_type()? != t {
                return Ok(false);
            }
        }
        if let Some(sender) = &self.sender {
            if header.sender()? != Some(sender.as_str()) {
                return Ok(false);
            }
        }
        if let Some(interface) = &self.interface {
            if header.interface()? != Some(interface.as_str()) {
                return Ok(false);
            }
        }
        if let Some(member) = &self.member {
            if header.member()? != Some(member.as_str()) {
                return Ok(false);
            }
        }
        if let Some(path) = &self.path {
            if header.path()? != Some(path.as_str()) {
                return Ok(false);
            }
        }
        if let Some(destination) = &self.destination {
            if header.destination()? != Some(destination.as_str()) {
                return Ok(false);
            }
        }
        if let Some(arg0) = &self.arg0 {
            if header.signature()? != Some("s") {
                return Ok(false);
            }
            let body: String = msg.body()?;
            if &body != arg0 {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::MatchRule;
    use crate::{Message, MessageType};

    fn signal(iface: &str, member: &str, body: &str) -> Message {
        Message::signal(Some(":1.5"), None, "/org/rbus/Test", iface, member, &body).unwrap()
    }

    #[test]
    fn empty_rule_matches_all() {
        let rule = MatchRule::new();
        assert!(rule.matches(&signal("org.rbus.Test", "Fired", "x")).unwrap());
    }

    #[test]
    fn field_mismatch() {
        let rule = MatchRule::new()
            .msg_type(MessageType::Signal)
            .interface("org.rbus.Test")
            .member("Fired");

        assert!(rule.matches(&signal("org.rbus.Test", "Fired", "x")).unwrap());
        assert!(!rule.matches(&signal("org.rbus.Test", "Other", "x")).unwrap());
        assert!(!rule.matches(&signal("org.rbus.Nope", "Fired", "x")).unwrap());

        let call = Message::method(None, None, "/", Some("org.rbus.Test"), "Fired", &()).unwrap();
        assert!(!rule.matches(&call).unwrap());
    }

    #[test]
    fn sender_and_path() {
        let rule = MatchRule::new().sender(":1.5").path("/org/rbus/Test");
        assert!(rule.matches(&signal("a.b", "M", "x")).unwrap());

        let rule = MatchRule::new().sender(":1.6");
        assert!(!rule.matches(&signal("a.b", "M", "x")).unwrap());
    }

    #[test]
    fn arg0_matching() {
        let rule = MatchRule::new().arg0("hello");
        assert!(rule.matches(&signal("a.b", "M", "hello")).unwrap());
        assert!(!rule.matches(&signal("a.b", "M", "nope")).unwrap());

        // Non-string bodies never match an arg0 rule.
        let msg = Message::signal(None, None, "/", "a.b", "M", &(7u32)).unwrap();
        assert!(!rule.matches(&msg).unwrap());
    }
}
