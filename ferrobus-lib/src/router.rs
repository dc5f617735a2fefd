//! Two-stage demultiplexing of inbound traffic: first by message kind,
//! then signals by object path and (interface, member, first-argument)
//! filters. Also owns the pending-call table and the object registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::*;

use ferrobus_common::errors::Error;
use ferrobus_common::message::{Message, MessageKind};
use ferrobus_common::types::ObjectPath;
use ferrobus_common::value::Value;
use ferrobus_common::PEER_INTERFACE;

use crate::bus::Bus;
use crate::object::{self, ObjectInner};
use crate::pending::PendingCall;

pub(crate) struct Subscriber {
    pub id: u64,
    pub interface: String,
    pub member: String,
    /// Optional filter on the first argument, the way match rules
    /// constrain `arg0`.
    pub arg0: Option<String>,
    pub active: AtomicBool,
    pub callback: Box<dyn Fn(Message) + Send + Sync>,
}

impl Subscriber {
    fn matches(&self, msg: &Message) -> bool {
        if msg.interface() != Some(self.interface.as_str())
            || msg.member() != Some(self.member.as_str())
        {
            return false;
        }

        match &self.arg0 {
            None => true,
            Some(expected) => matches!(
                msg.args().first(),
                Some(Value::String(actual)) if actual == expected
            ),
        }
    }
}

#[derive(Default)]
pub(crate) struct Router {
    pending: Mutex<HashMap<u32, PendingCall>>,
    signals: Mutex<HashMap<ObjectPath, Vec<Arc<Subscriber>>>>,
    objects: Mutex<HashMap<ObjectPath, Weak<ObjectInner>>>,
    next_subscriber_id: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- pending calls ----

    pub fn register_pending(&self, pending: PendingCall) {
        self.pending
            .lock()
            .unwrap()
            .insert(pending.serial(), pending);
    }

    pub fn remove_pending(&self, serial: u32) -> Option<PendingCall> {
        self.pending.lock().unwrap().remove(&serial)
    }

    /// Complete one pending call with an error, if it is still tracked.
    pub fn fail_pending(&self, serial: u32, error: Error) {
        if let Some(pending) = self.remove_pending(serial) {
            pending.complete(Err(error));
        }
    }

    /// Fail everything outstanding, e.g. on disconnect.
    pub fn fail_all_pending(&self, error: Error) {
        let drained: Vec<PendingCall> =
            self.pending.lock().unwrap().drain().map(|(_, p)| p).collect();
        for pending in drained {
            pending.complete(Err(error.clone()));
        }
    }

    /// The pending-call lock, held by the bus across serial assignment so
    /// a reply cannot race its own registration.
    pub fn pending_table(&self) -> &Mutex<HashMap<u32, PendingCall>> {
        &self.pending
    }

    // ---- signal subscriptions ----

    pub fn subscribe(
        &self,
        path: ObjectPath,
        interface: &str,
        member: &str,
        arg0: Option<String>,
        callback: Box<dyn Fn(Message) + Send + Sync>,
    ) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);

        self.signals
            .lock()
            .unwrap()
            .entry(path)
            .or_default()
            .push(Arc::new(Subscriber {
                id,
                interface: interface.into(),
                member: member.into(),
                arg0,
                active: AtomicBool::new(true),
                callback,
            }));

        id
    }

    pub fn unsubscribe(&self, path: &ObjectPath, id: u64) {
        let mut signals = self.signals.lock().unwrap();
        if let Some(subscribers) = signals.get_mut(path) {
            for subscriber in subscribers.iter() {
                if subscriber.id == id {
                    subscriber.active.store(false, Ordering::SeqCst);
                }
            }
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                signals.remove(path);
            }
        }
    }

    // ---- objects ----

    pub fn register_object(&self, path: ObjectPath, object: Weak<ObjectInner>) -> bool {
        let mut objects = self.objects.lock().unwrap();
        if let Some(existing) = objects.get(&path) {
            if existing.strong_count() > 0 {
                return false;
            }
        }
        objects.insert(path, object);
        true
    }

    pub fn unregister_object(&self, path: &ObjectPath) -> bool {
        self.objects.lock().unwrap().remove(path).is_some()
    }

    /// Direct child segments under `parent`, for the introspection
    /// document of a registered object.
    pub fn child_paths(&self, parent: &ObjectPath) -> Vec<String> {
        let prefix = if parent.as_str() == "/" {
            "/".to_string()
        } else {
            format!("{}/", parent.as_str())
        };

        let objects = self.objects.lock().unwrap();
        let mut children: Vec<String> = objects
            .keys()
            .filter(|path| path.as_str() != parent.as_str())
            .filter_map(|path| path.as_str().strip_prefix(&prefix))
            .map(|rest| {
                rest.split_once('/')
                    .map(|(head, _)| head)
                    .unwrap_or(rest)
                    .to_string()
            })
            .collect();

        children.sort();
        children.dedup();
        children
    }

    // ---- dispatch ----

    /// Stage-one dispatch: the bus filter hands every inbound message
    /// here.
    pub fn route(&self, bus: &Bus, msg: Message) {
        match msg.kind() {
            MessageKind::MethodReturn | MessageKind::Error => self.resolve_reply(msg),
            MessageKind::Signal => self.fan_out(msg),
            MessageKind::MethodCall => self.dispatch_call(bus, msg),
            MessageKind::Invalid => {
                warn!("Dropping inbound message of invalid kind");
            }
        }
    }

    fn resolve_reply(&self, mut msg: Message) {
        // required header, enforced at decode
        let Some(serial) = msg.reply_serial() else {
            return;
        };

        let Some(pending) = self.remove_pending(serial) else {
            trace!("Dropping reply to unknown call {serial}");
            return;
        };

        let outcome = if msg.kind() == MessageKind::Error {
            let name = msg.error_name().unwrap_or_default().to_string();
            let text = msg.reader().pop::<String>().unwrap_or_default();
            Err(Error::from_reply(&name, text))
        } else {
            Ok(msg)
        };

        pending.complete(outcome);
    }

    fn fan_out(&self, msg: Message) {
        let Some(path) = msg.path() else {
            return;
        };

        // snapshot, so a subscriber may unsubscribe from within its own
        // callback without affecting this emission
        let snapshot: Vec<Arc<Subscriber>> = {
            let signals = self.signals.lock().unwrap();
            match signals.get(path) {
                Some(subscribers) => subscribers
                    .iter()
                    .filter(|s| s.active.load(Ordering::SeqCst) && s.matches(&msg))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };

        if snapshot.is_empty() {
            trace!(
                "Dropping signal {}.{} without subscribers",
                msg.interface().unwrap_or_default(),
                msg.member().unwrap_or_default()
            );
            return;
        }

        let last = snapshot.len() - 1;
        let mut msg = Some(msg);
        for (i, subscriber) in snapshot.iter().enumerate() {
            let delivery = if i == last {
                msg.take().unwrap()
            } else {
                match msg.as_ref().unwrap().try_clone() {
                    Ok(copy) => copy,
                    Err(e) => {
                        warn!("Failed to duplicate a signal for fan-out: {e}");
                        continue;
                    }
                }
            };

            (subscriber.callback)(delivery);
        }
    }

    fn dispatch_call(&self, bus: &Bus, msg: Message) {
        // every connection answers liveness queries, registered or not
        if msg.interface() == Some(PEER_INTERFACE) {
            return self.handle_peer(bus, msg);
        }

        let Some(path) = msg.path().cloned() else {
            return;
        };

        let object = self
            .objects
            .lock()
            .unwrap()
            .get(&path)
            .and_then(Weak::upgrade);

        match object {
            Some(inner) => object::dispatch(bus, &inner, msg),
            None => {
                debug!("Method call to unregistered path `{path}`");
                bus.reply_error(&msg, &Error::UnknownObject(path.to_string()));
            }
        }
    }

    fn handle_peer(&self, bus: &Bus, msg: Message) {
        match msg.member() {
            Some("Ping") => bus.reply_return(&msg, |_| Ok(())),
            Some("GetMachineId") => {
                bus.reply_return(&msg, |writer| writer.append(crate::machine_id()))
            }
            other => {
                let member = other.unwrap_or_default().to_string();
                bus.reply_error(&msg, &Error::UnknownMethod(member));
            }
        }
    }
}
