//! The bus connection: construction and the Hello handshake, name
//! ownership, the send/call paths, match-rule subscriptions, object
//! registration and teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use log::*;

use ferrobus_common::address::{self, WellKnownBus};
use ferrobus_common::errors::{Error, Result};
use ferrobus_common::message::{Message, MessageKind, Writer};
use ferrobus_common::types::ObjectPath;
use ferrobus_common::{
    names, RequestNameReply, ReleaseNameReply, DAEMON_INTERFACE, DAEMON_NAME, DAEMON_PATH,
};

use crate::channel::Channel;
use crate::match_rule::MatchRule;
use crate::object::Object;
use crate::pending::PendingCall;
use crate::reactor;
use crate::router::Router;

/// Construction performs the Hello round trip under this timeout.
const HELLO_TIMEOUT: Duration = Duration::from_secs(1);

/// Default deadline for method calls that do not specify one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

pub(crate) struct BusInner {
    pub(crate) channel: Arc<Channel>,
    pub(crate) router: Arc<Router>,
    unique_name: OnceLock<String>,
    matches: Mutex<HashMap<String, usize>>,
    executor_installed: AtomicBool,
    pub(crate) runtime: OnceLock<tokio::runtime::Handle>,
    pub(crate) drain_scheduled: AtomicBool,
}

impl BusInner {
    fn close(&self) {
        self.channel.close();
        self.router.fail_all_pending(Error::Disconnected);
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// One attached connection to a bus daemon. Cheap to clone; all clones
/// share the transport, router and subscriptions.
#[derive(Clone)]
pub struct Bus {
    pub(crate) inner: Arc<BusInner>,
}

/// A well-known name owned (or queued for) by this connection. Handed
/// back to [`Bus::release_name`] when no longer wanted; the daemon also
/// reclaims it when the connection goes away.
#[derive(Debug)]
pub struct OwnedName {
    name: String,
}

impl OwnedName {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Bus {
    /// Connect to the user's session bus.
    pub fn session() -> Result<Self> {
        Self::open(&address::resolve(WellKnownBus::Session)?)
    }

    /// Connect to the system bus.
    pub fn system() -> Result<Self> {
        Self::open(&address::resolve(WellKnownBus::System)?)
    }

    /// Connect to the bus that activated this process.
    pub fn starter() -> Result<Self> {
        Self::open(&address::resolve(WellKnownBus::Starter)?)
    }

    /// Open a private connection to an address string and perform the
    /// Hello handshake. Any failure along the way fails construction.
    pub fn open(address: &str) -> Result<Self> {
        crate::global_init();

        let channel = Arc::new(Channel::connect(address, HELLO_TIMEOUT)?);

        let bus = Self {
            inner: Arc::new(BusInner {
                channel,
                router: Arc::new(Router::new()),
                unique_name: OnceLock::new(),
                matches: Mutex::new(HashMap::new()),
                executor_installed: AtomicBool::new(false),
                runtime: OnceLock::new(),
                drain_scheduled: AtomicBool::new(false),
            }),
        };

        let hello = Message::method_call(DAEMON_NAME, DAEMON_PATH, DAEMON_INTERFACE, "Hello")?;
        let mut reply = bus
            .inner
            .channel
            .blocking_round_trip(hello, HELLO_TIMEOUT)
            .and_then(map_reply)
            .map_err(|e| Error::ConnectionFailed(format!("Hello handshake failed: {e}")))?;

        let (unique_name,) = reply.read_args::<(String,)>()?;
        debug!("Connected to the bus as `{unique_name}`");
        let _ = bus.inner.unique_name.set(unique_name);

        Ok(bus)
    }

    /// The unique name the daemon assigned in the Hello handshake.
    pub fn unique_name(&self) -> &str {
        self.inner
            .unique_name
            .get()
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Bind the connection to the current tokio runtime: watch the socket,
    /// drive timeouts and dispatch inbound traffic. Without an executor
    /// only the blocking call paths make progress.
    pub fn install_executor(&self) -> Result<()> {
        if self.inner.executor_installed.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRegistered("executor".into()));
        }

        reactor::install(self)
    }

    pub(crate) fn executor_installed(&self) -> bool {
        self.inner.executor_installed.load(Ordering::SeqCst)
    }

    /// Queue one message. Returns the serial assigned to it; successive
    /// sends get strictly increasing serials and zero is never handed out.
    pub fn send(&self, msg: Message) -> Result<u32> {
        let serial = self.inner.channel.queue(msg)?;

        if !self.executor_installed() {
            self.inner.channel.try_flush().map_err(|e| {
                self.inner.close();
                Error::SendFailure(e.to_string())
            })?;
        }

        Ok(serial)
    }

    /// Send a method call and return the handle tracking its reply. The
    /// timeout starts counting once an executor drives the connection.
    pub fn call_async(&self, msg: Message, timeout: Duration) -> Result<PendingCall> {
        if self.inner.channel.is_closed() {
            return Err(Error::Disconnected);
        }

        let pending;
        {
            // registration holds the pending lock across serial
            // assignment, so the reply cannot race it
            let mut table = self.inner.router.pending_table().lock().unwrap();
            let serial = self.inner.channel.queue(msg)?;
            pending = PendingCall::new(serial);
            table.insert(serial, pending.clone());
        }

        if self.executor_installed() {
            self.arm_timeout(&pending, timeout);
        } else if let Err(e) = self.inner.channel.try_flush() {
            self.inner.close();
            self.inner.router.fail_all_pending(Error::Disconnected);
            return Err(Error::SendFailure(e.to_string()));
        }

        Ok(pending)
    }

    fn arm_timeout(&self, pending: &PendingCall, timeout: Duration) {
        let Some(runtime) = self.inner.runtime.get() else {
            return;
        };

        let router = Arc::downgrade(&self.inner.router);
        let serial = pending.serial();
        let task = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            // a dead router means the bus is gone; nothing to expire
            if let Some(router) = router.upgrade() {
                router.fail_pending(serial, Error::Timeout);
            }
        });

        pending.set_timer(task.abort_handle());
    }

    /// Send a method call and block the calling thread for the reply.
    ///
    /// On a bus driven by an executor this must not be invoked from the
    /// executor's own context: it would deadlock dispatch, so it fails
    /// with [`Error::BlockingOnBoundBus`]. Other threads park on a
    /// completion latch; without an executor the calling thread pumps the
    /// socket itself.
    pub fn call_blocking(&self, msg: Message, timeout: Duration) -> Result<Message> {
        if self.executor_installed() {
            if tokio::runtime::Handle::try_current().is_ok() {
                return Err(Error::BlockingOnBoundBus);
            }

            let pending = self.call_async(msg, timeout)?;
            let (tx, rx) = std::sync::mpsc::channel();
            pending.on_complete(move |outcome| {
                let _ = tx.send(outcome);
            });

            // the timer completes the call with Timeout; the extra grace
            // only covers a runtime that went away beneath us
            match rx.recv_timeout(timeout + Duration::from_secs(1)) {
                Ok(outcome) => outcome,
                Err(_) => {
                    pending.cancel();
                    Err(Error::Timeout)
                }
            }
        } else {
            self.inner
                .channel
                .blocking_round_trip(msg, timeout)
                .and_then(map_reply)
        }
    }

    /// Round trip used by the daemon operations: asynchronous when an
    /// executor runs the connection, pumping inline before one exists.
    pub(crate) async fn daemon_round_trip(
        &self,
        msg: Message,
        timeout: Duration,
    ) -> Result<Message> {
        if self.executor_installed() {
            self.call_async(msg, timeout)?.wait().await
        } else {
            self.inner
                .channel
                .blocking_round_trip(msg, timeout)
                .and_then(map_reply)
        }
    }

    fn daemon_call(&self, member: &str) -> Result<Message> {
        Message::method_call(DAEMON_NAME, DAEMON_PATH, DAEMON_INTERFACE, member)
    }

    /// Ask the daemon for ownership of a well-known name.
    pub async fn request_name(&self, name: &str, flags: u32) -> Result<OwnedName> {
        names::validate_bus_name(name)?;

        let mut msg = self.daemon_call("RequestName")?;
        msg.write_args((name.to_string(), flags))?;

        let mut reply = self.daemon_round_trip(msg, DEFAULT_CALL_TIMEOUT).await?;
        let (code,) = reply.read_args::<(u32,)>()?;

        match RequestNameReply::from_code(code) {
            Some(RequestNameReply::PrimaryOwner) => {
                info!("Now primary owner of `{name}`");
                Ok(OwnedName { name: name.into() })
            }
            Some(RequestNameReply::InQueue) => {
                info!("Queued for ownership of `{name}`");
                Ok(OwnedName { name: name.into() })
            }
            Some(RequestNameReply::Exists) => Err(Error::AlreadyOwned(name.into())),
            Some(RequestNameReply::AlreadyOwner) => Err(Error::AlreadyOwner(name.into())),
            None => Err(Error::MalformedMessage(format!(
                "unknown RequestName reply code {code}"
            ))),
        }
    }

    /// Give a name back to the daemon. The daemon's verdict is surfaced:
    /// releasing a name this connection does not own is an error, not a
    /// silent no-op.
    pub async fn release_name(&self, name: OwnedName) -> Result<()> {
        let mut msg = self.daemon_call("ReleaseName")?;
        msg.write_args((name.name.clone(),))?;

        let mut reply = self.daemon_round_trip(msg, DEFAULT_CALL_TIMEOUT).await?;
        let (code,) = reply.read_args::<(u32,)>()?;

        match ReleaseNameReply::from_code(code) {
            Some(ReleaseNameReply::Released) => Ok(()),
            Some(ReleaseNameReply::NonExistent) => Err(Error::NameNonExistent(name.name)),
            Some(ReleaseNameReply::NotOwner) => Err(Error::NotOwner(name.name)),
            None => Err(Error::MalformedMessage(format!(
                "unknown ReleaseName reply code {code}"
            ))),
        }
    }

    /// Non-authoritative query whether anyone currently owns `name`.
    pub async fn has_owner(&self, name: &str) -> Result<bool> {
        let mut msg = self.daemon_call("NameHasOwner")?;
        msg.write_args((name.to_string(),))?;

        let mut reply = self.daemon_round_trip(msg, DEFAULT_CALL_TIMEOUT).await?;
        let (owned,) = reply.read_args::<(bool,)>()?;
        Ok(owned)
    }

    /// Subscribe this connection to the signals a rule selects. Identical
    /// rules share one daemon-side registration.
    pub async fn add_match(&self, rule: &MatchRule) -> Result<()> {
        self.add_match_str(&rule.to_string()).await
    }

    pub(crate) async fn add_match_str(&self, rule: &str) -> Result<()> {
        let first = {
            let mut matches = self.inner.matches.lock().unwrap();
            let count = matches.entry(rule.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if !first {
            return Ok(());
        }

        let mut msg = self.daemon_call("AddMatch")?;
        msg.write_args((rule.to_string(),))?;

        match self.daemon_round_trip(msg, DEFAULT_CALL_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let mut matches = self.inner.matches.lock().unwrap();
                if let Some(count) = matches.get_mut(rule) {
                    *count -= 1;
                    if *count == 0 {
                        matches.remove(rule);
                    }
                }
                Err(e)
            }
        }
    }

    /// Drop one reference on a rule; the daemon registration goes away
    /// with the last one.
    pub async fn remove_match(&self, rule: &MatchRule) -> Result<()> {
        self.remove_match_str(&rule.to_string()).await
    }

    pub(crate) async fn remove_match_str(&self, rule: &str) -> Result<()> {
        let last = {
            let mut matches = self.inner.matches.lock().unwrap();
            match matches.get_mut(rule) {
                None => return Ok(()),
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        matches.remove(rule);
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if !last {
            return Ok(());
        }

        let mut msg = self.daemon_call("RemoveMatch")?;
        msg.write_args((rule.to_string(),))?;
        self.daemon_round_trip(msg, DEFAULT_CALL_TIMEOUT)
            .await
            .map(drop)
    }

    /// Install `object` on `path`. One object per path; the registry keeps
    /// a weak reference, so dropping the object simply makes the path
    /// answer with the unknown-object error again.
    pub fn register_object(&self, path: &str, object: &Object) -> Result<()> {
        let path = ObjectPath::new(path)?;

        if !self
            .inner
            .router
            .register_object(path.clone(), object.downgrade())
        {
            return Err(Error::AlreadyRegistered(path.to_string()));
        }

        if let Err(e) = object.bind(self, path.clone()) {
            self.inner.router.unregister_object(&path);
            return Err(e);
        }

        debug!("Registered object on `{path}`");
        Ok(())
    }

    pub fn unregister_object(&self, path: &str) -> Result<()> {
        let path = ObjectPath::new(path)?;
        if self.inner.router.unregister_object(&path) {
            debug!("Unregistered object on `{path}`");
            Ok(())
        } else {
            Err(Error::UnknownObject(path.to_string()))
        }
    }

    /// Close the connection: tears the transport down, fails everything
    /// pending with [`Error::Disconnected`] and stops the executor tasks.
    pub fn close(&self) {
        self.inner.close();
    }

    // ---- reply helpers used by the dispatch side ----

    pub(crate) fn reply_return(
        &self,
        call: &Message,
        fill: impl FnOnce(&mut Writer) -> Result<()>,
    ) {
        if call.no_reply_expected() {
            return;
        }

        let mut reply = Message::method_return(call);
        let filled = {
            let mut writer = reply.writer();
            fill(&mut writer)
        };

        match filled {
            Ok(()) => {
                if let Err(e) = self.send(reply) {
                    warn!("Failed to send a reply: {e}");
                }
            }
            Err(e) => {
                error!("Failed to encode a reply: {e}");
                self.reply_error(call, &e);
            }
        }
    }

    pub(crate) fn reply_error(&self, call: &Message, error: &Error) {
        if call.no_reply_expected() {
            return;
        }

        if let Err(e) = self.send(Message::error_from(call, error)) {
            warn!("Failed to send an error reply: {e}");
        }
    }
}

fn map_reply(mut reply: Message) -> Result<Message> {
    if reply.kind() == MessageKind::Error {
        let name = reply.error_name().unwrap_or_default().to_string();
        let text = reply.reader().pop::<String>().unwrap_or_default();
        Err(Error::from_reply(&name, text))
    } else {
        Ok(reply)
    }
}
