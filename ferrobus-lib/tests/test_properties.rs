use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferrobus_common::PROPERTIES_INTERFACE;
use ferrobus_lib::{Bus, Error, Object, Proxy, ServedProperty, Variant};

use fixture::{wait_until, Fixture};

struct PropertySetup {
    _service: Bus,
    _client: Bus,
    level: ServedProperty<u32>,
    proxy: Proxy,
}

async fn property_setup(fixture: &Fixture, service_name: &str) -> PropertySetup {
    let service = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    service.install_executor().expect("Failed to install the executor");
    service
        .request_name(service_name, 0)
        .await
        .expect("Failed to request a name");

    let object = Object::new();
    let level = object
        .register_property::<u32>("org.test.Props", "Level", 1, true)
        .expect("Failed to register a property");
    object
        .register_property::<String>("org.test.Props", "Tag", "base".into(), false)
        .expect("Failed to register a property");
    service
        .register_object("/obj", &object)
        .expect("Failed to register the object");

    let client = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    client.install_executor().expect("Failed to install the executor");
    let proxy = Proxy::new(&client, service_name, "/obj").expect("proxy");

    PropertySetup {
        _service: service,
        _client: client,
        level,
        proxy,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_property_round_trip_and_change_tracking() {
    let fixture = Fixture::start();
    let setup = property_setup(&fixture, "org.test.props").await;

    let property = setup
        .proxy
        .property::<u32>("org.test.Props", "Level", true)
        .expect("property handle");

    // cold reads round-trip
    assert_eq!(property.get().await.expect("get"), 1);

    // a successful write lands remotely and in the cache
    property.set(42).await.expect("set");
    assert_eq!(property.get().await.expect("get"), 42);
    assert_eq!(setup.level.get().expect("served value"), 42);

    // subscribed: a server-side update shows up exactly once
    let events: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    property
        .subscribe(move |value| sink.lock().unwrap().push(value))
        .await
        .expect("subscribe");

    setup.level.set(7).expect("served set");

    let observer = events.clone();
    wait_until(move || !observer.lock().unwrap().is_empty()).await;

    // the cache serves the pushed value without another round trip
    assert_eq!(property.get().await.expect("get"), 7);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*events.lock().unwrap(), vec![7]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_only_properties() {
    let fixture = Fixture::start();
    let setup = property_setup(&fixture, "org.test.props2").await;

    // locally declared read-only: refused before any traffic
    let local = setup
        .proxy
        .property::<String>("org.test.Props", "Tag", false)
        .expect("property handle");
    let err = local.set("new".into()).await.unwrap_err();
    assert!(matches!(err, Error::ReadOnly(_)));

    // declared writable here, but the server refuses the write
    let remote = setup
        .proxy
        .property::<String>("org.test.Props", "Tag", true)
        .expect("property handle");
    let err = remote.set("new".into()).await.unwrap_err();
    assert!(matches!(err, Error::ReadOnly(_)));

    assert_eq!(remote.get().await.expect("get"), "base");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_all_and_unknown_property() {
    let fixture = Fixture::start();
    let setup = property_setup(&fixture, "org.test.props3").await;

    let (all,): (HashMap<String, Variant>,) = setup
        .proxy
        .call(
            PROPERTIES_INTERFACE,
            "GetAll",
            ("org.test.Props".to_string(),),
        )
        .await
        .expect("GetAll");
    assert_eq!(all.len(), 2);
    assert!(all.contains_key("Level"));
    assert!(all.contains_key("Tag"));

    let missing = setup
        .proxy
        .property::<u32>("org.test.Props", "Missing", true)
        .expect("property handle");
    let err = missing.get().await.unwrap_err();
    assert!(matches!(err, Error::UnknownProperty(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_introspection_lists_the_members() {
    let fixture = Fixture::start();
    let setup = property_setup(&fixture, "org.test.props4").await;

    let xml = setup.proxy.introspect().await.expect("Introspect");

    assert!(xml.contains("<interface name=\"org.test.Props\">"));
    assert!(xml.contains("<property name=\"Level\" type=\"u\" access=\"readwrite\"/>"));
    assert!(xml.contains("<property name=\"Tag\" type=\"s\" access=\"read\"/>"));
    assert!(xml.contains("<interface name=\"org.freedesktop.DBus.Properties\">"));
    assert!(xml.contains("<method name=\"Introspect\">"));
}
