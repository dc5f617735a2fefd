//! The tokio binding that drives a bus: a watch task turning socket
//! readiness into channel progress, one-shot timeout tasks for pending
//! calls, and a dispatch-drain task that collapses concurrent wakes.
//!
//! Long-lived tasks hold the channel and a weak bus reference only: they
//! never keep a dead bus alive, and a callback racing teardown resolves
//! to a no-op when the upgrade fails.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use log::*;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use ferrobus_common::errors::{Error, Result};

use crate::bus::{Bus, BusInner};
use crate::channel::Channel;

struct WatchFd(RawFd);

impl AsRawFd for WatchFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Bind the bus to the current tokio runtime. Failing to register the
/// socket watch is fatal: the connection cannot make progress without it.
pub(crate) fn install(bus: &Bus) -> Result<()> {
    let handle = tokio::runtime::Handle::try_current().map_err(|_| {
        Error::ConnectionFailed("no tokio runtime to install the executor on".into())
    })?;
    let _ = bus.inner.runtime.set(handle.clone());

    bus.inner.channel.set_event_driven()?;

    let async_fd = AsyncFd::new(WatchFd(bus.inner.channel.fd()))
        .map_err(|e| Error::ConnectionFailed(format!("failed to register the bus watch: {e}")))?;

    let weak = Arc::downgrade(&bus.inner);
    let channel = bus.inner.channel.clone();
    handle.spawn(watch_task(weak, channel, async_fd));

    // traffic may already be queued from the blocking construction phase
    bus.inner.channel.watch_changed.notify_one();
    if bus.inner.channel.has_inbound() {
        schedule_drain(&Arc::downgrade(&bus.inner));
    }

    Ok(())
}

async fn watch_task(weak: Weak<BusInner>, channel: Arc<Channel>, async_fd: AsyncFd<WatchFd>) {
    loop {
        if channel.is_closed() {
            connection_lost(&weak, &channel);
            return;
        }

        let interest = if channel.wants_write() {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };

        tokio::select! {
            guard = async_fd.ready(interest) => {
                match guard {
                    Ok(mut guard) => {
                        let ready = guard.ready();

                        if ready.is_writable() && channel.try_flush().is_err() {
                            connection_lost(&weak, &channel);
                            return;
                        }

                        if ready.is_readable() || ready.is_read_closed() {
                            match channel.handle_readable() {
                                Ok(frames) => {
                                    if frames > 0 {
                                        schedule_drain(&weak);
                                    }
                                }
                                Err(e) => {
                                    debug!("Bus connection lost: {e}");
                                    connection_lost(&weak, &channel);
                                    return;
                                }
                            }
                        }

                        guard.clear_ready();
                    }
                    Err(e) => {
                        warn!("Watch failure on the bus socket: {e}");
                        connection_lost(&weak, &channel);
                        return;
                    }
                }
            }
            // write interest appeared, new outbound data, or shutdown
            _ = channel.watch_changed.notified() => {
                if channel.try_flush().is_err() {
                    connection_lost(&weak, &channel);
                    return;
                }
            }
        }
    }
}

/// Schedule the dispatch drain. Concurrent wakes collapse into at most
/// one scheduled task, and the drain itself is never re-entered.
fn schedule_drain(weak: &Weak<BusInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };

    if inner.drain_scheduled.swap(true, Ordering::SeqCst) {
        return;
    }
    drop(inner);

    let weak = weak.clone();
    tokio::spawn(async move {
        loop {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let bus = Bus {
                inner: inner.clone(),
            };

            while let Some(msg) = inner.channel.pop_inbound() {
                inner.router.route(&bus, msg);
            }

            inner.drain_scheduled.store(false, Ordering::SeqCst);

            // a frame may have slipped in between the last pop and the
            // flag reset; reclaim the drain if nobody else has
            if inner.channel.has_inbound()
                && !inner.drain_scheduled.swap(true, Ordering::SeqCst)
            {
                continue;
            }
            return;
        }
    });
}

fn connection_lost(weak: &Weak<BusInner>, channel: &Arc<Channel>) {
    channel.close();
    if let Some(inner) = weak.upgrade() {
        inner.router.fail_all_pending(Error::Disconnected);
    }
}
