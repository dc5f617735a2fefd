//! Validation for the name grammars of the protocol: bus names, interface
//! names, member names and error names all have their own rules.

use crate::errors::{Error, Result};

const MAX_NAME_LEN: usize = 255;

/// An interface name: two or more `.`-separated elements, each of
/// `[A-Za-z0-9_]`, not starting with a digit.
pub fn validate_interface_name(name: &str) -> Result<()> {
    validate_dotted(name, false).map_err(|_| Error::InvalidName(name.into()))
}

/// An error name follows the interface name grammar.
pub fn validate_error_name(name: &str) -> Result<()> {
    validate_interface_name(name)
}

/// A bus name: either a unique name (`:` followed by dotted elements which
/// may start with digits) or a well-known name following the interface
/// grammar with `-` additionally allowed.
pub fn validate_bus_name(name: &str) -> Result<()> {
    let result = match name.strip_prefix(':') {
        Some(rest) => validate_dotted_unique(rest),
        None => validate_dotted(name, true),
    };

    result.map_err(|_| Error::InvalidName(name.into()))
}

/// A member name: one element of `[A-Za-z0-9_]+`, not starting with a digit.
pub fn validate_member_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName(name.into()));
    }

    let bytes = name.as_bytes();
    if bytes[0].is_ascii_digit() {
        return Err(Error::InvalidName(name.into()));
    }

    if bytes
        .iter()
        .all(|c| c.is_ascii_alphanumeric() || *c == b'_')
    {
        Ok(())
    } else {
        Err(Error::InvalidName(name.into()))
    }
}

fn validate_dotted(name: &str, allow_hyphen: bool) -> std::result::Result<(), ()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || !name.contains('.') {
        return Err(());
    }

    for element in name.split('.') {
        let bytes = element.as_bytes();

        if bytes.is_empty() || bytes[0].is_ascii_digit() {
            return Err(());
        }

        for &c in bytes {
            match c {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' => {}
                b'-' if allow_hyphen => {}
                _ => return Err(()),
            }
        }
    }

    Ok(())
}

fn validate_dotted_unique(rest: &str) -> std::result::Result<(), ()> {
    if rest.is_empty() || rest.len() + 1 > MAX_NAME_LEN || !rest.contains('.') {
        return Err(());
    }

    for element in rest.split('.') {
        if element.is_empty() {
            return Err(());
        }

        for &c in element.as_bytes() {
            match c {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' => {}
                _ => return Err(()),
            }
        }
    }

    Ok(())
}
