//! Builder for the daemon's match-rule syntax.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use ferrobus_common::message::MessageKind;

/// A predicate on inbound messages, compiled to the daemon's
/// `key='value',...` syntax on subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    kind: Option<MessageKind>,
    sender: Option<String>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    args: BTreeMap<u8, String>,
}

impl MatchRule {
    /// A rule matching signals; the usual starting point.
    pub fn signal() -> Self {
        Self {
            kind: Some(MessageKind::Signal),
            ..Default::default()
        }
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Constrain a string argument by position (`arg0`, `arg1`, ...).
    pub fn arg(mut self, index: u8, value: impl Into<String>) -> Self {
        self.args.insert(index, value.into());
        self
    }
}

impl Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::with_capacity(6);

        if let Some(kind) = self.kind {
            let name = match kind {
                MessageKind::Signal => "signal",
                MessageKind::MethodCall => "method_call",
                MessageKind::MethodReturn => "method_return",
                MessageKind::Error => "error",
                MessageKind::Invalid => "signal",
            };
            parts.push(format!("type='{name}'"));
        }
        if let Some(sender) = &self.sender {
            parts.push(format!("sender='{sender}'"));
        }
        if let Some(path) = &self.path {
            parts.push(format!("path='{path}'"));
        }
        if let Some(interface) = &self.interface {
            parts.push(format!("interface='{interface}'"));
        }
        if let Some(member) = &self.member {
            parts.push(format!("member='{member}'"));
        }
        for (index, value) in &self.args {
            parts.push(format!("arg{index}='{value}'"));
        }

        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_in_daemon_syntax() {
        let rule = MatchRule::signal()
            .path("/org/example/Object")
            .interface("org.example.Iface")
            .member("Changed")
            .arg(0, "org.example.Iface");

        assert_eq!(
            rule.to_string(),
            "type='signal',path='/org/example/Object',interface='org.example.Iface',\
             member='Changed',arg0='org.example.Iface'"
        );
    }
}
