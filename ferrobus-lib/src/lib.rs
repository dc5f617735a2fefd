//! Client/server library for the desktop message bus.
//!
//! A [`Bus`] is one authenticated connection to a bus daemon. Through it a
//! process can own well-known names, call methods on remote objects via a
//! [`Proxy`], serve its own [`Object`]s with methods, signals and
//! properties, subscribe to signals by match rule, and track remote
//! properties with [`Property`].
//!
//! Protocol progress is driven by an executor bound to the tokio runtime
//! with [`Bus::install_executor`]. Without one, only the blocking call
//! paths are available.

mod auth;
mod bus;
mod channel;
mod introspect;
mod match_rule;
mod object;
mod pending;
mod property;
mod proxy;
mod reactor;
mod router;

use std::sync::{Mutex, Once};

pub use ferrobus_common::{
    address::WellKnownBus, ArgList, BusType, Error, Message, MessageKind, ObjectPath, Reader,
    Result, Signature, UnixFd, Value, Variant, Writer,
};

pub use bus::{Bus, OwnedName};
pub use introspect::{Arg, Direction, Interface, Member, Node, PropertyInfo};
pub use match_rule::MatchRule;
pub use object::{Object, Replier, ServedProperty, SignalEmitter};
pub use pending::PendingCall;
pub use property::Property;
pub use proxy::{Proxy, Subscription};

/// Environment variable that opts into installing a process-exit handler
/// which runs [`shutdown`] exactly once.
pub const SHUTDOWN_HANDLER_ENV: &str = "DBUS_CPP_INSTALL_DBUS_SHUTDOWN_HANDLER";

static INIT: Once = Once::new();
static MACHINE_ID: Mutex<Option<String>> = Mutex::new(None);

/// Process-wide one-time setup, run on first bus construction.
pub(crate) fn global_init() {
    INIT.call_once(|| {
        let install = std::env::var(SHUTDOWN_HANDLER_ENV)
            .map(|v| !v.is_empty())
            .unwrap_or(false);

        if install {
            let _ = unsafe { libc::atexit(shutdown_at_exit) };
        }
    });
}

extern "C" fn shutdown_at_exit() {
    shutdown();
}

/// Release process-global resources held by the library. Safe to call at
/// any time; buses keep working and re-populate what they need.
pub fn shutdown() {
    if let Ok(mut id) = MACHINE_ID.lock() {
        *id = None;
    }
}

/// The machine UUID answered on `org.freedesktop.DBus.Peer.GetMachineId`.
pub(crate) fn machine_id() -> String {
    if let Ok(cached) = MACHINE_ID.lock() {
        if let Some(id) = cached.as_ref() {
            return id.clone();
        }
    }

    let id = ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|contents| contents.trim().to_string())
        .unwrap_or_else(|| "0".repeat(32));

    if let Ok(mut cached) = MACHINE_ID.lock() {
        *cached = Some(id.clone());
    }

    id
}
