use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use ferrobus_common::PEER_INTERFACE;
use ferrobus_lib::{Bus, Error, Message, Object, Proxy, Result, UnixFd};

use fixture::Fixture;

fn calc_service(fixture: &Fixture) -> (Bus, Object) {
    let bus = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    bus.install_executor().expect("Failed to install the executor");

    let object = Object::new();
    object
        .register_method("org.test.Calc", "Add", |(a, b): (i32, i32)| Ok((a + b,)))
        .expect("Failed to register a method");
    object
        .register_method("org.test.Calc", "Fail", |_: ()| -> Result<(String,)> {
            Err(Error::Remote {
                name: "org.test.Error.Nope".into(),
                message: "not today".into(),
            })
        })
        .expect("Failed to register a method");

    bus.register_object("/org/test/calc", &object)
        .expect("Failed to register the object");

    (bus, object)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_typed_method_calls() {
    let fixture = Fixture::start();
    let (service, _object) = calc_service(&fixture);
    service
        .request_name("org.test.calls", 0)
        .await
        .expect("Failed to request a name");

    let client = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    client.install_executor().expect("Failed to install the executor");
    let proxy = Proxy::new(&client, "org.test.calls", "/org/test/calc").expect("proxy");

    // a valid call round-trips typed arguments
    let (sum,): (i32,) = proxy
        .call("org.test.Calc", "Add", (2i32, 3i32))
        .await
        .expect("Failed to call Add");
    assert_eq!(sum, 5);

    // handler errors surface with their wire name
    let err = proxy
        .call::<(), (String,)>("org.test.Calc", "Fail", ())
        .await
        .unwrap_err();
    match err {
        Error::Remote { name, .. } => assert_eq!(name, "org.test.Error.Nope"),
        other => panic!("expected a remote error, got {other:?}"),
    }

    // mismatched argument types are rejected by the handler side
    let err = proxy
        .call::<(String,), (i32,)>("org.test.Calc", "Add", ("two".into(),))
        .await
        .unwrap_err();
    match err {
        Error::Remote { name, .. } => {
            assert_eq!(name, "org.freedesktop.DBus.Error.InvalidArgs")
        }
        other => panic!("expected an invalid-args error, got {other:?}"),
    }

    // dispatch misses map to their specific kinds
    let err = proxy
        .call::<(), ()>("org.test.Calc", "Missing", ())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownMethod(_)));

    let err = proxy
        .call::<(), ()>("org.test.Missing", "Anything", ())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownInterface(_)));

    let orphan = Proxy::new(&client, "org.test.calls", "/nowhere").expect("proxy");
    let err = orphan
        .call::<(), ()>("org.test.Calc", "Add", ())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownObject(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unregistering_frees_the_path() {
    let fixture = Fixture::start();
    let (service, object) = calc_service(&fixture);

    // the path is taken
    let second = Object::new();
    let err = service
        .register_object("/org/test/calc", &second)
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyRegistered(_)));

    // and free again after unregistration
    service.unregister_object("/org/test/calc").unwrap();
    service
        .register_object("/org/test/calc", &second)
        .expect("Failed to re-register the path");

    drop(object);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocking_calls() {
    let fixture = Fixture::start();
    let (service, _object) = calc_service(&fixture);

    // a bus without an executor pumps the socket from the calling thread
    let client = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    let proxy = Proxy::new(&client, service.unique_name(), "/").expect("proxy");
    proxy
        .call_blocking::<(), ()>(PEER_INTERFACE, "Ping", ())
        .expect("Failed to ping");

    // a bound bus refuses to block the executor context
    let bound = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    bound.install_executor().expect("Failed to install the executor");
    let bound_proxy = Proxy::new(&bound, service.unique_name(), "/").expect("proxy");
    let err = bound_proxy
        .call_blocking::<(), ()>(PEER_INTERFACE, "Ping", ())
        .unwrap_err();
    assert!(matches!(err, Error::BlockingOnBoundBus));

    // but a plain thread may park on the completion latch
    let thread_bus = bound.clone();
    let destination = service.unique_name().to_string();
    let outcome = std::thread::spawn(move || {
        let proxy = Proxy::new(&thread_bus, &destination, "/").expect("proxy");
        proxy.call_blocking::<(), ()>(PEER_INTERFACE, "Ping", ())
    })
    .join()
    .expect("thread panicked");
    outcome.expect("Failed to ping from a thread");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_timeout_and_late_cancel() {
    let fixture = Fixture::start();

    let service = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    service.install_executor().expect("Failed to install the executor");

    let object = Object::new();
    object
        .register_raw_handler("org.test.Slow", "Never", |_msg, _replier| {
            // dropping the reply builder defers the reply forever
        })
        .expect("Failed to register a handler");
    service
        .register_object("/slow", &object)
        .expect("Failed to register the object");

    let client = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    client.install_executor().expect("Failed to install the executor");

    let msg =
        Message::method_call(service.unique_name(), "/slow", "org.test.Slow", "Never").unwrap();
    let started = Instant::now();
    let pending = client
        .call_async(msg, Duration::from_millis(300))
        .expect("call_async");
    let watcher = pending.clone();

    let err = pending.wait().await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));

    // cancelling after completion changes nothing
    watcher.cancel();
    assert!(watcher.is_complete());

    // the connection is unaffected
    let proxy = Proxy::new(&client, service.unique_name(), "/").expect("proxy");
    proxy.ping().await.expect("Failed to ping");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_descriptor_passing() {
    let fixture = Fixture::start();

    let service = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    service.install_executor().expect("Failed to install the executor");

    let object = Object::new();
    object
        .register_raw_handler("org.test.Fd", "Take", |mut msg, replier| {
            let (mut fd,): (UnixFd,) = msg.read_args().expect("descriptor argument");
            let owned = fd.take().expect("descriptor owned after decode");
            assert!(fd.take().is_none());

            let mut stream = UnixStream::from(owned);
            stream.write_all(b"over the bus").expect("write to the fd");
            replier.send(());
        })
        .expect("Failed to register a handler");
    service
        .register_object("/fd", &object)
        .expect("Failed to register the object");

    let client = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    client.install_executor().expect("Failed to install the executor");

    let (left, right) = UnixStream::pair().expect("socketpair");
    let mut msg =
        Message::method_call(service.unique_name(), "/fd", "org.test.Fd", "Take").unwrap();
    msg.write_args((UnixFd::new(left.into()),)).unwrap();

    client
        .call_async(msg, Duration::from_secs(5))
        .expect("call_async")
        .wait()
        .await
        .expect("Failed to pass a descriptor");

    let mut right = right;
    right
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut text = [0u8; 12];
    right.read_exact(&mut text).expect("read from the fd");
    assert_eq!(&text, b"over the bus");
}
