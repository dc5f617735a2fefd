//! Bus address strings and well-known bus resolution.
//!
//! Addresses follow `transport:key=value,key=value[;...]`. Only unix-domain
//! transports are understood; a list of addresses is tried in order by the
//! connection code.

use std::collections::HashMap;
use std::env;

use crate::errors::{Error, Result};

pub const SESSION_ADDRESS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";
pub const SYSTEM_ADDRESS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";
pub const STARTER_ADDRESS_ENV: &str = "DBUS_STARTER_ADDRESS";
pub const STARTER_BUS_TYPE_ENV: &str = "DBUS_STARTER_BUS_TYPE";

const DEFAULT_SYSTEM_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// The well-known buses a connection can be opened to without spelling out
/// an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WellKnownBus {
    Session,
    System,
    /// The bus that activated this process.
    Starter,
}

/// One parsed `transport:key=value,...` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    transport: String,
    options: HashMap<String, String>,
}

impl AddressEntry {
    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Filesystem path of a `unix:path=` entry.
    pub fn unix_path(&self) -> Option<&str> {
        (self.transport == "unix").then(|| self.option("path")).flatten()
    }

    /// Abstract-namespace name of a `unix:abstract=` entry.
    pub fn unix_abstract(&self) -> Option<&str> {
        (self.transport == "unix")
            .then(|| self.option("abstract"))
            .flatten()
    }
}

/// Parse an address string into its `;`-separated entries.
pub fn parse(address: &str) -> Result<Vec<AddressEntry>> {
    let bad = || Error::ConnectionFailed(format!("malformed bus address `{address}`"));

    let mut entries = Vec::new();
    for part in address.split(';') {
        if part.is_empty() {
            continue;
        }

        let (transport, rest) = part.split_once(':').ok_or_else(bad)?;
        if transport.is_empty() {
            return Err(bad());
        }

        let mut options = HashMap::new();
        for pair in rest.split(',') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').ok_or_else(bad)?;
            options.insert(key.to_string(), unescape(value).ok_or_else(bad)?);
        }

        entries.push(AddressEntry {
            transport: transport.to_string(),
            options,
        });
    }

    if entries.is_empty() {
        return Err(bad());
    }

    Ok(entries)
}

/// Resolve a well-known bus to its address string from the environment.
pub fn resolve(bus: WellKnownBus) -> Result<String> {
    match bus {
        WellKnownBus::Session => env::var(SESSION_ADDRESS_ENV).map_err(|_| {
            Error::ConnectionFailed(format!("{SESSION_ADDRESS_ENV} is not set"))
        }),
        WellKnownBus::System => Ok(env::var(SYSTEM_ADDRESS_ENV)
            .unwrap_or_else(|_| DEFAULT_SYSTEM_ADDRESS.to_string())),
        WellKnownBus::Starter => {
            if let Ok(address) = env::var(STARTER_ADDRESS_ENV) {
                return Ok(address);
            }

            match env::var(STARTER_BUS_TYPE_ENV).as_deref() {
                Ok("session") => resolve(WellKnownBus::Session),
                Ok("system") => resolve(WellKnownBus::System),
                _ => Err(Error::ConnectionFailed(
                    "not started by the bus: no starter address in the environment".into(),
                )),
            }
        }
    }
}

/// Undo the `%xx` escaping address values may use.
fn unescape(value: &str) -> Option<String> {
    if !value.contains('%') {
        return Some(value.to_string());
    }

    let mut out = Vec::with_capacity(value.len());
    let mut bytes = value.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = char::from(bytes.next()?).to_digit(16)?;
            let lo = char::from(bytes.next()?).to_digit(16)?;
            out.push((hi * 16 + lo) as u8);
        } else {
            out.push(b);
        }
    }

    String::from_utf8(out).ok()
}
