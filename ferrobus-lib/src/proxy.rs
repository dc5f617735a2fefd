//! Client-side proxies: typed invocations against a (destination, path)
//! pair, and signal subscriptions that pair a daemon match rule with a
//! router registration.

use std::time::Duration;

use log::*;

use ferrobus_common::errors::Result;
use ferrobus_common::message::Message;
use ferrobus_common::types::ObjectPath;
use ferrobus_common::{names, ArgList, BusType, INTROSPECTABLE_INTERFACE, PEER_INTERFACE};

use crate::bus::{Bus, DEFAULT_CALL_TIMEOUT};
use crate::match_rule::MatchRule;
use crate::property::Property;

/// A remote object: nothing but a naming record over a [`Bus`], plus the
/// typed call and subscription plumbing.
#[derive(Clone)]
pub struct Proxy {
    bus: Bus,
    destination: String,
    path: ObjectPath,
    timeout: Duration,
}

impl Proxy {
    pub fn new(bus: &Bus, destination: &str, path: &str) -> Result<Self> {
        names::validate_bus_name(destination)?;

        Ok(Self {
            bus: bus.clone(),
            destination: destination.into(),
            path: ObjectPath::new(path)?,
            timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    /// Use a different deadline for calls made through this proxy.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    fn build_call<A: ArgList>(
        &self,
        interface: &str,
        member: &str,
        args: A,
    ) -> Result<Message> {
        let mut msg = Message::method_call(
            &self.destination,
            self.path.as_str(),
            interface,
            member,
        )?;
        msg.write_args(args)?;
        Ok(msg)
    }

    /// Invoke a method and decode its reply.
    pub async fn call<A: ArgList, R: ArgList>(
        &self,
        interface: &str,
        member: &str,
        args: A,
    ) -> Result<R> {
        self.call_with_timeout(interface, member, args, self.timeout)
            .await
    }

    pub async fn call_with_timeout<A: ArgList, R: ArgList>(
        &self,
        interface: &str,
        member: &str,
        args: A,
        timeout: Duration,
    ) -> Result<R> {
        let msg = self.build_call(interface, member, args)?;
        let mut reply = self.bus.daemon_round_trip(msg, timeout).await?;
        reply.read_args::<R>()
    }

    /// Invoke a method from a thread that is allowed to block. See
    /// [`Bus::call_blocking`] for the executor-thread restriction.
    pub fn call_blocking<A: ArgList, R: ArgList>(
        &self,
        interface: &str,
        member: &str,
        args: A,
    ) -> Result<R> {
        let msg = self.build_call(interface, member, args)?;
        let mut reply = self.bus.call_blocking(msg, self.timeout)?;
        reply.read_args::<R>()
    }

    /// Liveness round trip against the peer.
    pub async fn ping(&self) -> Result<()> {
        self.call::<(), ()>(PEER_INTERFACE, "Ping", ()).await
    }

    /// Fetch the remote introspection document.
    pub async fn introspect(&self) -> Result<String> {
        let (xml,) = self
            .call::<(), (String,)>(INTROSPECTABLE_INTERFACE, "Introspect", ())
            .await?;
        Ok(xml)
    }

    /// Subscribe to a signal this object emits. The daemon-side match
    /// rule and the local fan-out registration live until the returned
    /// handle is cancelled.
    pub async fn subscribe<F>(
        &self,
        interface: &str,
        member: &str,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.subscribe_impl(interface, member, None, callback).await
    }

    /// Subscribe with an additional filter on the signal's first string
    /// argument, the usual way to track per-name signals such as
    /// `NameOwnerChanged`. Only emissions whose first argument equals
    /// `arg0` are delivered.
    pub async fn subscribe_filtered<F>(
        &self,
        interface: &str,
        member: &str,
        arg0: &str,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.subscribe_impl(interface, member, Some(arg0.to_string()), callback)
            .await
    }

    async fn subscribe_impl<F>(
        &self,
        interface: &str,
        member: &str,
        arg0: Option<String>,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        names::validate_interface_name(interface)?;
        names::validate_member_name(member)?;

        let mut rule = MatchRule::signal()
            .sender(&self.destination)
            .path(self.path.as_str())
            .interface(interface)
            .member(member);
        if let Some(arg0) = &arg0 {
            rule = rule.arg(0, arg0);
        }
        let rule = rule.to_string();

        self.bus.add_match_str(&rule).await?;

        let id = self.bus.inner.router.subscribe(
            self.path.clone(),
            interface,
            member,
            arg0,
            Box::new(callback),
        );

        debug!(
            "Subscribed to {interface}.{member} on `{}` from `{}`",
            self.path, self.destination
        );

        Ok(Subscription {
            bus: self.bus.clone(),
            path: self.path.clone(),
            id,
            rule,
        })
    }

    /// Handle on a property of this object.
    pub fn property<T: BusType>(
        &self,
        interface: &str,
        name: &str,
        writable: bool,
    ) -> Result<Property<T>> {
        names::validate_interface_name(interface)?;
        names::validate_member_name(name)?;
        Ok(Property::new(self.clone(), interface, name, writable))
    }
}

/// An active signal subscription. Cancelling removes the local fan-out
/// entry immediately and drops one reference on the daemon match rule.
pub struct Subscription {
    bus: Bus,
    path: ObjectPath,
    id: u64,
    rule: String,
}

impl Subscription {
    /// Stop delivery. Callable from inside the subscription's own
    /// callback; the current emission still completes for everyone else.
    pub async fn cancel(self) -> Result<()> {
        self.cancel_local();
        self.bus.remove_match_str(&self.rule).await
    }

    /// Stop local delivery without telling the daemon. Used where
    /// awaiting is impossible; the match-rule reference is released when
    /// the subscription is dropped later or leaks with the connection.
    pub fn cancel_local(&self) {
        self.bus.inner.router.unsubscribe(&self.path, self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_local();
    }
}
