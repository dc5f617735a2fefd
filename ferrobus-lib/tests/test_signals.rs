use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ferrobus_lib::{Bus, Object, Proxy, Subscription};

use fixture::{wait_until, Fixture};

struct SignalSetup {
    _service: Bus,
    _client: Bus,
    object: Object,
    proxy: Proxy,
}

async fn signal_setup(fixture: &Fixture, service_name: &str) -> SignalSetup {
    let service = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    service.install_executor().expect("Failed to install the executor");
    service
        .request_name(service_name, 0)
        .await
        .expect("Failed to request a name");

    let object = Object::new();
    service
        .register_object("/foo", &object)
        .expect("Failed to register the object");

    let client = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    client.install_executor().expect("Failed to install the executor");
    let proxy = Proxy::new(&client, service_name, "/foo").expect("proxy");

    SignalSetup {
        _service: service,
        _client: client,
        object,
        proxy,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fan_out_in_registration_order() {
    let fixture = Fixture::start();
    let setup = signal_setup(&fixture, "org.test.signals").await;

    let emitter = setup
        .object
        .register_signal::<(u32,)>("org.test.Iface", "Changed")
        .expect("Failed to register a signal");

    let log: Arc<Mutex<Vec<(&'static str, u32)>>> = Arc::new(Mutex::new(Vec::new()));

    let first_log = log.clone();
    let _first = setup
        .proxy
        .subscribe("org.test.Iface", "Changed", move |mut msg| {
            let (value,): (u32,) = msg.read_args().expect("signal argument");
            first_log.lock().unwrap().push(("first", value));
        })
        .await
        .expect("Failed to subscribe");

    let second_log = log.clone();
    let _second = setup
        .proxy
        .subscribe("org.test.Iface", "Changed", move |mut msg| {
            let (value,): (u32,) = msg.read_args().expect("signal argument");
            second_log.lock().unwrap().push(("second", value));
        })
        .await
        .expect("Failed to subscribe");

    emitter.emit((7u32,)).expect("Failed to emit");

    let observer = log.clone();
    wait_until(move || observer.lock().unwrap().len() == 2).await;
    assert_eq!(
        *log.lock().unwrap(),
        vec![("first", 7u32), ("second", 7u32)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unsubscribe_from_inside_the_callback() {
    let fixture = Fixture::start();
    let setup = signal_setup(&fixture, "org.test.signals2").await;

    let emitter = setup
        .object
        .register_signal::<(u32,)>("org.test.Iface", "Once")
        .expect("Failed to register a signal");

    let first_count = Arc::new(AtomicU32::new(0));
    let second_count = Arc::new(AtomicU32::new(0));

    // the first subscriber drops its own subscription while handling the
    // first emission
    let own_handle: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

    let counter = first_count.clone();
    let handle_slot = own_handle.clone();
    let subscription = setup
        .proxy
        .subscribe("org.test.Iface", "Once", move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(handle_slot.lock().unwrap().take());
        })
        .await
        .expect("Failed to subscribe");
    *own_handle.lock().unwrap() = Some(subscription);

    let counter = second_count.clone();
    let _second = setup
        .proxy
        .subscribe("org.test.Iface", "Once", move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .expect("Failed to subscribe");

    // both see the first emission, the self-unsubscribed one misses the
    // second
    emitter.emit((1u32,)).expect("Failed to emit");
    let observer = second_count.clone();
    wait_until(move || observer.load(Ordering::SeqCst) == 1).await;

    emitter.emit((2u32,)).expect("Failed to emit");
    let observer = second_count.clone();
    wait_until(move || observer.load(Ordering::SeqCst) == 2).await;

    assert_eq!(first_count.load(Ordering::SeqCst), 1);
    assert_eq!(second_count.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_first_argument_filter() {
    let fixture = Fixture::start();
    let setup = signal_setup(&fixture, "org.test.signals4").await;

    let emitter = setup
        .object
        .register_signal::<(String, u32)>("org.test.Iface", "Owner")
        .expect("Failed to register a signal");

    let all: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let filtered: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = all.clone();
    let _all_sub = setup
        .proxy
        .subscribe("org.test.Iface", "Owner", move |mut msg| {
            let (_, value): (String, u32) = msg.read_args().expect("signal arguments");
            sink.lock().unwrap().push(value);
        })
        .await
        .expect("Failed to subscribe");

    let sink = filtered.clone();
    let _filtered_sub = setup
        .proxy
        .subscribe_filtered("org.test.Iface", "Owner", "right", move |mut msg| {
            let (arg0, value): (String, u32) = msg.read_args().expect("signal arguments");
            assert_eq!(arg0, "right");
            sink.lock().unwrap().push(value);
        })
        .await
        .expect("Failed to subscribe");

    emitter.emit(("left".into(), 1)).expect("Failed to emit");
    emitter.emit(("right".into(), 2)).expect("Failed to emit");

    let observer = all.clone();
    wait_until(move || observer.lock().unwrap().len() == 2).await;
    assert_eq!(*all.lock().unwrap(), vec![1, 2]);

    // only the emission whose first argument matched got through
    assert_eq!(*filtered.lock().unwrap(), vec![2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_off_emission_without_emitter_handle() {
    let fixture = Fixture::start();
    let setup = signal_setup(&fixture, "org.test.signals3").await;

    let seen = Arc::new(AtomicU32::new(0));
    let counter = seen.clone();
    let _sub = setup
        .proxy
        .subscribe("org.test.Iface", "Ping", move |mut msg| {
            let (value,): (String,) = msg.read_args().expect("signal argument");
            assert_eq!(value, "hello");
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .expect("Failed to subscribe");

    setup
        .object
        .emit("org.test.Iface", "Ping", ("hello".to_string(),))
        .expect("Failed to emit");

    let observer = seen.clone();
    wait_until(move || observer.load(Ordering::SeqCst) == 1).await;
}
