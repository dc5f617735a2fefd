//! Data model and XML rendering of the introspection document.

use std::fmt::Write as _;

use ferrobus_common::types::Signature;
use ferrobus_common::{INTROSPECTABLE_INTERFACE, PEER_INTERFACE, PROPERTIES_INTERFACE};

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection \
                       1.0//EN\"\n \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Arg {
    pub name: String,
    pub signature: Signature,
    pub direction: Direction,
}

/// A method or signal of an interface.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub args: Vec<Arg>,
}

impl Member {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument per complete type of `signature`, named by
    /// direction and position.
    pub fn push_args(&mut self, signature: &Signature, direction: Direction) {
        let prefix = match direction {
            Direction::In => "in",
            Direction::Out => "out",
        };

        let offset = self
            .args
            .iter()
            .filter(|arg| arg.direction == direction)
            .count();

        for (i, complete) in signature.complete_types().enumerate() {
            self.args.push(Arg {
                name: format!("{prefix}{}", offset + i),
                signature: Signature::new(complete)
                    .unwrap_or_else(|_| Signature::empty()),
                direction,
            });
        }
    }
}

#[derive(Debug, Clone)]
pub struct PropertyInfo {
    pub name: String,
    pub signature: Signature,
    pub writable: bool,
}

#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub methods: Vec<Member>,
    pub signals: Vec<Member>,
    pub properties: Vec<PropertyInfo>,
}

impl Interface {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            signals: Vec::new(),
            properties: Vec::new(),
        }
    }
}

/// One node of the object tree: its interfaces plus the names of direct
/// children.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub interfaces: Vec<Interface>,
    pub children: Vec<String>,
}

impl Node {
    /// Render the document, standard interfaces included.
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(1024);
        out.push_str(DOCTYPE);
        out.push_str("<node>\n");

        for interface in &self.interfaces {
            write_interface(&mut out, interface);
        }
        write_standard_interfaces(&mut out);

        for child in &self.children {
            let _ = writeln!(out, " <node name=\"{child}\"/>");
        }

        out.push_str("</node>\n");
        out
    }
}

fn write_interface(out: &mut String, interface: &Interface) {
    let _ = writeln!(out, " <interface name=\"{}\">", interface.name);

    for method in &interface.methods {
        write_member(out, "method", method);
    }
    for signal in &interface.signals {
        write_member(out, "signal", signal);
    }
    for property in &interface.properties {
        let access = if property.writable {
            "readwrite"
        } else {
            "read"
        };
        let _ = writeln!(
            out,
            "  <property name=\"{}\" type=\"{}\" access=\"{access}\"/>",
            property.name, property.signature
        );
    }

    out.push_str(" </interface>\n");
}

fn write_member(out: &mut String, element: &str, member: &Member) {
    if member.args.is_empty() {
        let _ = writeln!(out, "  <{element} name=\"{}\"/>", member.name);
        return;
    }

    let _ = writeln!(out, "  <{element} name=\"{}\">", member.name);
    for arg in &member.args {
        // signals carry no direction attribute, their args are always out
        if element == "signal" {
            let _ = writeln!(
                out,
                "   <arg name=\"{}\" type=\"{}\"/>",
                arg.name, arg.signature
            );
        } else {
            let _ = writeln!(
                out,
                "   <arg name=\"{}\" type=\"{}\" direction=\"{}\"/>",
                arg.name,
                arg.signature,
                arg.direction.as_str()
            );
        }
    }
    let _ = writeln!(out, "  </{element}>");
}

fn write_standard_interfaces(out: &mut String) {
    let _ = writeln!(out, " <interface name=\"{INTROSPECTABLE_INTERFACE}\">");
    out.push_str("  <method name=\"Introspect\">\n");
    out.push_str("   <arg name=\"out0\" type=\"s\" direction=\"out\"/>\n");
    out.push_str("  </method>\n </interface>\n");

    let _ = writeln!(out, " <interface name=\"{PEER_INTERFACE}\">");
    out.push_str("  <method name=\"Ping\"/>\n");
    out.push_str("  <method name=\"GetMachineId\">\n");
    out.push_str("   <arg name=\"out0\" type=\"s\" direction=\"out\"/>\n");
    out.push_str("  </method>\n </interface>\n");

    let _ = writeln!(out, " <interface name=\"{PROPERTIES_INTERFACE}\">");
    out.push_str("  <method name=\"Get\">\n");
    out.push_str("   <arg name=\"in0\" type=\"s\" direction=\"in\"/>\n");
    out.push_str("   <arg name=\"in1\" type=\"s\" direction=\"in\"/>\n");
    out.push_str("   <arg name=\"out0\" type=\"v\" direction=\"out\"/>\n");
    out.push_str("  </method>\n");
    out.push_str("  <method name=\"Set\">\n");
    out.push_str("   <arg name=\"in0\" type=\"s\" direction=\"in\"/>\n");
    out.push_str("   <arg name=\"in1\" type=\"s\" direction=\"in\"/>\n");
    out.push_str("   <arg name=\"in2\" type=\"v\" direction=\"in\"/>\n");
    out.push_str("  </method>\n");
    out.push_str("  <method name=\"GetAll\">\n");
    out.push_str("   <arg name=\"in0\" type=\"s\" direction=\"in\"/>\n");
    out.push_str("   <arg name=\"out0\" type=\"a{sv}\" direction=\"out\"/>\n");
    out.push_str("  </method>\n");
    out.push_str("  <signal name=\"PropertiesChanged\">\n");
    out.push_str("   <arg name=\"out0\" type=\"s\"/>\n");
    out.push_str("   <arg name=\"out1\" type=\"a{sv}\"/>\n");
    out.push_str("   <arg name=\"out2\" type=\"as\"/>\n");
    out.push_str("  </signal>\n </interface>\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_node_document() {
        let mut method = Member::new("Scale");
        method.push_args(&Signature::new("ud").unwrap(), Direction::In);
        method.push_args(&Signature::new("d").unwrap(), Direction::Out);

        let mut signal = Member::new("Changed");
        signal.push_args(&Signature::new("u").unwrap(), Direction::Out);

        let node = Node {
            interfaces: vec![Interface {
                name: "org.example.Calc".into(),
                methods: vec![method],
                signals: vec![signal],
                properties: vec![PropertyInfo {
                    name: "Level".into(),
                    signature: Signature::new("u").unwrap(),
                    writable: true,
                }],
            }],
            children: vec!["child".into()],
        };

        let xml = node.to_xml();
        assert!(xml.starts_with("<!DOCTYPE node PUBLIC"));
        assert!(xml.contains("<interface name=\"org.example.Calc\">"));
        assert!(xml.contains("<arg name=\"in1\" type=\"d\" direction=\"in\"/>"));
        assert!(xml.contains("<arg name=\"out0\" type=\"d\" direction=\"out\"/>"));
        assert!(xml.contains("<property name=\"Level\" type=\"u\" access=\"readwrite\"/>"));
        assert!(xml.contains("<node name=\"child\"/>"));
        assert!(xml.contains("<interface name=\"org.freedesktop.DBus.Properties\">"));
        assert!(xml.ends_with("</node>\n"));
    }
}
