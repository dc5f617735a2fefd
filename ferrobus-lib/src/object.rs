//! Server-side objects: a per-path table of method handlers, signal
//! emitters, served properties and the standard-interface plumbing
//! (introspection and the property protocol).

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};

use log::*;

use ferrobus_common::errors::{Error, Result};
use ferrobus_common::message::{Message, Writer};
use ferrobus_common::types::{ObjectPath, Signature};
use ferrobus_common::value::Value;
use ferrobus_common::{names, ArgList, BusType, INTROSPECTABLE_INTERFACE, PROPERTIES_INTERFACE};

use crate::bus::{Bus, BusInner};
use crate::introspect;

type RawHandler = Box<dyn Fn(Message, Replier) + Send + Sync>;

pub(crate) struct MethodMeta {
    pub in_sig: Signature,
    pub out_sig: Signature,
}

struct MethodEntry {
    handler: RawHandler,
    /// Argument metadata for the introspection document; raw handlers do
    /// not have any.
    meta: Option<MethodMeta>,
}

pub(crate) struct PropertySlot {
    value: Mutex<Value>,
    signature: Signature,
    writable: bool,
}

type MemberKey = (String, String);

pub(crate) struct ObjectInner {
    binding: Mutex<Option<(Weak<BusInner>, ObjectPath)>>,
    methods: Mutex<HashMap<MemberKey, Arc<MethodEntry>>>,
    signals: Mutex<HashMap<MemberKey, Signature>>,
    properties: Mutex<HashMap<MemberKey, Arc<PropertySlot>>>,
}

/// A server-side object: register it on a [`Bus`] path and it answers
/// method calls by (interface, member), emits signals from that path and
/// serves its registered properties over the standard property protocol.
#[derive(Clone, Default)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

impl Default for ObjectInner {
    fn default() -> Self {
        Self {
            binding: Mutex::new(None),
            methods: Mutex::new(HashMap::new()),
            signals: Mutex::new(HashMap::new()),
            properties: Mutex::new(HashMap::new()),
        }
    }
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a typed handler to (interface, member). Exactly one handler
    /// per member; the argument signatures feed the introspection
    /// document.
    pub fn register_method<P, R, F>(&self, interface: &str, member: &str, f: F) -> Result<()>
    where
        P: ArgList + 'static,
        R: ArgList + 'static,
        F: Fn(P) -> Result<R> + Send + Sync + 'static,
    {
        let handler: RawHandler = Box::new(move |mut msg: Message, replier: Replier| {
            match msg.read_args::<P>() {
                Ok(args) => match f(args) {
                    Ok(ret) => replier.send(ret),
                    Err(e) => replier.send_error(&e),
                },
                Err(e) => {
                    warn!("Rejecting call with malformed arguments: {e}");
                    replier.send_error(&e);
                }
            }
        });

        self.insert_handler(
            interface,
            member,
            handler,
            Some(MethodMeta {
                in_sig: P::signature(),
                out_sig: R::signature(),
            }),
        )
    }

    /// Bind a handler working on the raw message. The reply builder may
    /// be moved away and used later to defer the reply; dropping it
    /// without sending leaves the call unanswered.
    pub fn register_raw_handler<F>(&self, interface: &str, member: &str, f: F) -> Result<()>
    where
        F: Fn(Message, Replier) + Send + Sync + 'static,
    {
        self.insert_handler(interface, member, Box::new(f), None)
    }

    fn insert_handler(
        &self,
        interface: &str,
        member: &str,
        handler: RawHandler,
        meta: Option<MethodMeta>,
    ) -> Result<()> {
        names::validate_interface_name(interface)?;
        names::validate_member_name(member)?;

        let mut methods = self.inner.methods.lock().unwrap();
        let key = (interface.to_string(), member.to_string());
        if methods.contains_key(&key) {
            return Err(Error::AlreadyRegistered(format!("{interface}.{member}")));
        }

        methods.insert(key, Arc::new(MethodEntry { handler, meta }));
        Ok(())
    }

    /// Declare a signal and get the emitter handle for it.
    pub fn register_signal<T: ArgList>(
        &self,
        interface: &str,
        member: &str,
    ) -> Result<SignalEmitter<T>> {
        names::validate_interface_name(interface)?;
        names::validate_member_name(member)?;

        let mut signals = self.inner.signals.lock().unwrap();
        let key = (interface.to_string(), member.to_string());
        if signals.contains_key(&key) {
            return Err(Error::AlreadyRegistered(format!("{interface}.{member}")));
        }
        signals.insert(key, T::signature());

        Ok(SignalEmitter {
            object: Arc::downgrade(&self.inner),
            interface: interface.to_string(),
            member: member.to_string(),
            _marker: PhantomData,
        })
    }

    /// Serve a property on this object. `Set` calls from peers are only
    /// honored when `writable`; local updates through the returned handle
    /// always work and emit the change signal either way.
    pub fn register_property<T: BusType>(
        &self,
        interface: &str,
        name: &str,
        initial: T,
        writable: bool,
    ) -> Result<ServedProperty<T>> {
        names::validate_interface_name(interface)?;
        names::validate_member_name(name)?;

        let mut properties = self.inner.properties.lock().unwrap();
        let key = (interface.to_string(), name.to_string());
        if properties.contains_key(&key) {
            return Err(Error::AlreadyRegistered(format!("{interface}.{name}")));
        }

        let slot = Arc::new(PropertySlot {
            value: Mutex::new(initial.into_value()),
            signature: T::signature(),
            writable,
        });
        properties.insert(key, slot.clone());

        Ok(ServedProperty {
            object: self.inner.clone(),
            slot,
            interface: interface.to_string(),
            name: name.to_string(),
            _marker: PhantomData,
        })
    }

    /// Emit a one-off signal from this object's path.
    pub fn emit<T: ArgList>(&self, interface: &str, member: &str, args: T) -> Result<()> {
        names::validate_interface_name(interface)?;
        names::validate_member_name(member)?;
        self.inner.emit_values(interface, member, args.into_values())
    }

    pub(crate) fn downgrade(&self) -> Weak<ObjectInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn bind(&self, bus: &Bus, path: ObjectPath) -> Result<()> {
        let mut binding = self.inner.binding.lock().unwrap();

        if let Some((weak, bound_path)) = &*binding {
            let same_bus = weak
                .upgrade()
                .is_some_and(|b| Arc::ptr_eq(&b, &bus.inner));
            if weak.strong_count() > 0 && (!same_bus || bound_path != &path) {
                return Err(Error::AlreadyRegistered(format!(
                    "object is registered on `{bound_path}`"
                )));
            }
        }

        *binding = Some((Arc::downgrade(&bus.inner), path));
        Ok(())
    }
}

impl ObjectInner {
    fn bound_bus(&self) -> Result<(Bus, ObjectPath)> {
        let binding = self.binding.lock().unwrap();
        let (weak, path) = binding
            .as_ref()
            .ok_or_else(|| Error::SendFailure("object is not registered on a bus".into()))?;
        let inner = weak.upgrade().ok_or(Error::Disconnected)?;
        Ok((Bus { inner }, path.clone()))
    }

    fn emit_values(&self, interface: &str, member: &str, values: Vec<Value>) -> Result<()> {
        let (bus, path) = self.bound_bus()?;

        let mut msg = Message::signal(path.as_str(), interface, member)?;
        {
            let mut writer = msg.writer();
            for value in values {
                writer.push_value(value)?;
            }
        }

        bus.send(msg).map(drop)
    }

    fn emit_properties_changed(&self, interface: &str, name: &str, value: Value) -> Result<()> {
        let (bus, path) = self.bound_bus()?;

        let mut msg = Message::signal(path.as_str(), PROPERTIES_INTERFACE, "PropertiesChanged")?;
        {
            let mut writer = msg.writer();
            writer.append(interface.to_string())?;
            writer.open_array(Signature::new("{sv}")?)?;
            writer.open_dict_entry()?;
            writer.push_value(Value::String(name.into()))?;
            writer.push_value(Value::Variant(Box::new(value)))?;
            writer.close_container()?;
            writer.close_container()?;
            writer.open_array(Signature::new("s")?)?;
            writer.close_container()?;
        }

        bus.send(msg).map(drop)
    }

    pub(crate) fn introspection_node(&self, children: Vec<String>) -> introspect::Node {
        fn entry<'a>(
            map: &'a mut HashMap<String, introspect::Interface>,
            name: &str,
        ) -> &'a mut introspect::Interface {
            map.entry(name.to_string())
                .or_insert_with(|| introspect::Interface::new(name))
        }

        let mut interfaces: HashMap<String, introspect::Interface> = HashMap::new();

        for ((interface, member), method_entry) in self.methods.lock().unwrap().iter() {
            let mut method = introspect::Member::new(member);
            if let Some(meta) = &method_entry.meta {
                method.push_args(&meta.in_sig, introspect::Direction::In);
                method.push_args(&meta.out_sig, introspect::Direction::Out);
            }
            entry(&mut interfaces, interface).methods.push(method);
        }

        for ((interface, member), signature) in self.signals.lock().unwrap().iter() {
            let mut signal = introspect::Member::new(member);
            signal.push_args(signature, introspect::Direction::Out);
            entry(&mut interfaces, interface).signals.push(signal);
        }

        for ((interface, name), slot) in self.properties.lock().unwrap().iter() {
            entry(&mut interfaces, interface)
                .properties
                .push(introspect::PropertyInfo {
                    name: name.clone(),
                    signature: slot.signature.clone(),
                    writable: slot.writable,
                });
        }

        let mut interfaces: Vec<introspect::Interface> = interfaces.into_values().collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        for interface in &mut interfaces {
            interface.methods.sort_by(|a, b| a.name.cmp(&b.name));
            interface.signals.sort_by(|a, b| a.name.cmp(&b.name));
            interface.properties.sort_by(|a, b| a.name.cmp(&b.name));
        }

        introspect::Node {
            interfaces,
            children,
        }
    }
}

/// Emitter handle for one declared signal.
pub struct SignalEmitter<T: ArgList> {
    object: Weak<ObjectInner>,
    interface: String,
    member: String,
    _marker: PhantomData<fn(T)>,
}

impl<T: ArgList> SignalEmitter<T> {
    pub fn emit(&self, args: T) -> Result<()> {
        let object = self.object.upgrade().ok_or(Error::Disconnected)?;
        object.emit_values(&self.interface, &self.member, args.into_values())
    }
}

impl<T: ArgList> Clone for SignalEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            object: self.object.clone(),
            interface: self.interface.clone(),
            member: self.member.clone(),
            _marker: PhantomData,
        }
    }
}

/// Handle on a property served by an [`Object`].
pub struct ServedProperty<T: BusType> {
    object: Arc<ObjectInner>,
    slot: Arc<PropertySlot>,
    interface: String,
    name: String,
    _marker: PhantomData<fn(T)>,
}

impl<T: BusType> ServedProperty<T> {
    pub fn get(&self) -> Result<T> {
        let value = self.slot.value.lock().unwrap().try_clone()?;
        T::from_value(value)
    }

    /// Update the value and notify subscribed peers. Updating before the
    /// object is registered only records the value locally.
    pub fn set(&self, value: T) -> Result<()> {
        let value = value.into_value();
        let for_signal = value.try_clone()?;

        let bound = self.object.binding.lock().unwrap().is_some();
        *self.slot.value.lock().unwrap() = value;

        if bound {
            self.object
                .emit_properties_changed(&self.interface, &self.name, for_signal)
        } else {
            Ok(())
        }
    }
}

/// Builder for the reply to one inbound call. Consumed by sending; can be
/// moved into a task to defer the reply. Dropping it without sending
/// leaves the call unanswered.
pub struct Replier {
    bus: Bus,
    call: Message,
}

impl Replier {
    /// Reply with a typed argument list.
    pub fn send<R: ArgList>(self, args: R) {
        self.send_with(|writer| {
            for value in args.into_values() {
                writer.push_value(value)?;
            }
            Ok(())
        })
    }

    /// Reply with arguments written through the cursor.
    pub fn send_with(self, fill: impl FnOnce(&mut Writer) -> Result<()>) {
        self.bus.reply_return(&self.call, fill)
    }

    /// Reply with an error value.
    pub fn send_error(self, error: &Error) {
        self.bus.reply_error(&self.call, error)
    }

    /// Reply with a custom error name.
    pub fn send_custom_error(self, name: &str, text: &str) {
        self.bus.reply_error(
            &self.call,
            &Error::Remote {
                name: name.into(),
                message: text.into(),
            },
        );
    }
}

/// Dispatch one method call to a registered object. Standard interfaces
/// are answered here; everything else goes through the handler table.
pub(crate) fn dispatch(bus: &Bus, object: &Arc<ObjectInner>, msg: Message) {
    let interface = msg.interface().unwrap_or_default().to_string();
    let member = msg.member().unwrap_or_default().to_string();

    if interface == PROPERTIES_INTERFACE {
        return handle_properties(bus, object, msg, &member);
    }

    if interface == INTROSPECTABLE_INTERFACE && member == "Introspect" {
        return handle_introspect(bus, object, msg);
    }

    let entry = object
        .methods
        .lock()
        .unwrap()
        .get(&(interface.clone(), member.clone()))
        .cloned();

    match entry {
        Some(entry) => {
            let replier = Replier {
                bus: bus.clone(),
                call: msg.header_clone(),
            };
            (entry.handler)(msg, replier);
        }
        None => {
            let known_interface = object
                .methods
                .lock()
                .unwrap()
                .keys()
                .any(|(i, _)| i == &interface);

            let error = if known_interface {
                Error::UnknownMethod(member)
            } else {
                Error::UnknownInterface(interface)
            };
            bus.reply_error(&msg, &error);
        }
    }
}

fn handle_properties(bus: &Bus, object: &Arc<ObjectInner>, mut msg: Message, member: &str) {
    let replier = Replier {
        bus: bus.clone(),
        call: msg.header_clone(),
    };

    match member {
        "Get" => {
            let (interface, name) = match msg.read_args::<(String, String)>() {
                Ok(args) => args,
                Err(e) => return replier.send_error(&e),
            };

            let slot = object
                .properties
                .lock()
                .unwrap()
                .get(&(interface, name.clone()))
                .cloned();

            match slot {
                Some(slot) => {
                    let value = slot.value.lock().unwrap().try_clone();
                    match value {
                        Ok(value) => replier.send_with(|writer| {
                            writer.open_variant(slot.signature.clone())?;
                            writer.push_value(value)?;
                            writer.close_container()
                        }),
                        Err(e) => replier.send_error(&e),
                    }
                }
                None => replier.send_error(&Error::UnknownProperty(name)),
            }
        }
        "Set" => {
            let (interface, name, variant) =
                match msg.read_args::<(String, String, ferrobus_common::Variant)>() {
                    Ok(args) => args,
                    Err(e) => return replier.send_error(&e),
                };

            let slot = object
                .properties
                .lock()
                .unwrap()
                .get(&(interface.clone(), name.clone()))
                .cloned();

            let Some(slot) = slot else {
                return replier.send_error(&Error::UnknownProperty(name));
            };

            if !slot.writable {
                return replier.send_error(&Error::ReadOnly(name));
            }

            let value = variant.into_inner();
            if value.signature() != slot.signature {
                return replier.send_error(&Error::TypeMismatch {
                    expected: slot.signature.as_str().as_bytes()[0] as char,
                    actual: value.type_code(),
                });
            }

            let for_signal = match value.try_clone() {
                Ok(copy) => copy,
                Err(e) => return replier.send_error(&e),
            };
            *slot.value.lock().unwrap() = value;

            replier.send(());
            if let Err(e) = object.emit_properties_changed(&interface, &name, for_signal) {
                warn!("Failed to emit the property change signal: {e}");
            }
        }
        "GetAll" => {
            let (interface,) = match msg.read_args::<(String,)>() {
                Ok(args) => args,
                Err(e) => return replier.send_error(&e),
            };

            let slots: Vec<(String, Arc<PropertySlot>)> = object
                .properties
                .lock()
                .unwrap()
                .iter()
                .filter(|((i, _), _)| i == &interface)
                .map(|((_, name), slot)| (name.clone(), slot.clone()))
                .collect();

            replier.send_with(|writer| {
                writer.open_array(Signature::new("{sv}")?)?;
                for (name, slot) in slots {
                    let value = slot.value.lock().unwrap().try_clone()?;
                    writer.open_dict_entry()?;
                    writer.push_value(Value::String(name))?;
                    writer.push_value(Value::Variant(Box::new(value)))?;
                    writer.close_container()?;
                }
                writer.close_container()
            })
        }
        other => replier.send_error(&Error::UnknownMethod(other.to_string())),
    }
}

fn handle_introspect(bus: &Bus, object: &Arc<ObjectInner>, msg: Message) {
    let children = match msg.path() {
        Some(path) => bus.inner.router.child_paths(path),
        None => Vec::new(),
    };

    let xml = object.introspection_node(children).to_xml();
    bus.reply_return(&msg, |writer| writer.append(xml));
}
