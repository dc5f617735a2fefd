//! Typed client-side view of a remote property: a cached value kept
//! current through the standard property protocol's change signal.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use log::*;

use ferrobus_common::errors::{Error, Result};
use ferrobus_common::message::Message;
use ferrobus_common::value::{Value, Variant};
use ferrobus_common::{BusType, PROPERTIES_INTERFACE};

use crate::proxy::{Proxy, Subscription};

/// One property of a remote object.
///
/// Unsubscribed, every [`Property::get`] is a round trip. Subscribed, the
/// value is served from a cache that follows the remote change signal;
/// the cache and the change notifications always refer to the same
/// last-observed update, serialized through the executor.
pub struct Property<T: BusType> {
    proxy: Proxy,
    interface: String,
    name: String,
    writable: bool,
    cache: Arc<Mutex<Option<Value>>>,
    subscription: Mutex<Option<Subscription>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: BusType> Property<T> {
    pub(crate) fn new(proxy: Proxy, interface: &str, name: &str, writable: bool) -> Self {
        Self {
            proxy,
            interface: interface.into(),
            name: name.into(),
            writable,
            cache: Arc::new(Mutex::new(None)),
            subscription: Mutex::new(None),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn is_subscribed(&self) -> bool {
        self.subscription.lock().unwrap().is_some()
    }

    fn cached(&self) -> Result<Option<Value>> {
        match &*self.cache.lock().unwrap() {
            Some(value) => Ok(Some(value.try_clone()?)),
            None => Ok(None),
        }
    }

    /// Current value: the warm cache when subscribed, a `Get` round trip
    /// otherwise.
    pub async fn get(&self) -> Result<T> {
        if self.is_subscribed() {
            if let Some(value) = self.cached()? {
                return T::from_value(value);
            }
        }

        let (variant,) = self
            .proxy
            .call::<(String, String), (Variant,)>(
                PROPERTIES_INTERFACE,
                "Get",
                (self.interface.clone(), self.name.clone()),
            )
            .await?;

        let value = variant.into_inner();
        *self.cache.lock().unwrap() = Some(value.try_clone()?);
        T::from_value(value)
    }

    /// Write the remote value; the local cache follows on success.
    pub async fn set(&self, value: T) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly(self.name.clone()));
        }

        let value = value.into_value();
        let cache_copy = value.try_clone()?;

        self.proxy
            .call::<(String, String, Variant), ()>(
                PROPERTIES_INTERFACE,
                "Set",
                (self.interface.clone(), self.name.clone(), Variant(value)),
            )
            .await?;

        *self.cache.lock().unwrap() = Some(cache_copy);
        Ok(())
    }

    /// Follow the remote change signal. Each remote emission updates the
    /// cache and fires `on_changed` exactly once; an invalidation marks
    /// the cache stale so the next [`Property::get`] round-trips again.
    pub async fn subscribe<F>(&self, on_changed: F) -> Result<()>
    where
        F: Fn(T) + Send + Sync + 'static,
        T: 'static,
    {
        if self.is_subscribed() {
            return Err(Error::AlreadyRegistered(format!(
                "{}.{}",
                self.interface, self.name
            )));
        }

        let cache = self.cache.clone();
        let name = self.name.clone();
        let subscription = self
            .proxy
            .subscribe_filtered(
                PROPERTIES_INTERFACE,
                "PropertiesChanged",
                &self.interface,
                move |mut msg: Message| {
                    let args =
                        msg.read_args::<(String, HashMap<String, Variant>, Vec<String>)>();
                    let (_, mut changed, invalidated) = match args {
                        Ok(args) => args,
                        Err(e) => {
                            warn!("Malformed property change signal: {e}");
                            return;
                        }
                    };

                    if let Some(variant) = changed.remove(&name) {
                        let value = variant.into_inner();
                        let for_callback = match value.try_clone().and_then(T::from_value) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!("Property `{name}` changed to an unexpected type: {e}");
                                return;
                            }
                        };

                        *cache.lock().unwrap() = Some(value);
                        on_changed(for_callback);
                    } else if invalidated.contains(&name) {
                        *cache.lock().unwrap() = None;
                    }
                },
            )
            .await?;

        *self.subscription.lock().unwrap() = Some(subscription);

        Ok(())
    }

    /// Stop following changes; the cache goes stale.
    pub async fn unsubscribe(&self) -> Result<()> {
        let subscription = self.subscription.lock().unwrap().take();
        *self.cache.lock().unwrap() = None;

        match subscription {
            Some(subscription) => subscription.cancel().await,
            None => Ok(()),
        }
    }
}
