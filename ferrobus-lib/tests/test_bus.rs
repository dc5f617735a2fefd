use std::time::Duration;

use ferrobus_common::{DAEMON_INTERFACE, DAEMON_NAME, DAEMON_PATH};
use ferrobus_lib::{Bus, Error, MatchRule, Message, Proxy};

use fixture::Fixture;

async fn match_count(bus: &Bus, rule: &MatchRule) -> u32 {
    let proxy = Proxy::new(bus, DAEMON_NAME, DAEMON_PATH).expect("daemon proxy");
    let (count,) = proxy
        .call::<(String,), (u32,)>(DAEMON_INTERFACE, "GetMatchCount", (rule.to_string(),))
        .await
        .expect("GetMatchCount");
    count
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hello_and_name_ownership() {
    let fixture = Fixture::start();

    let bus = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    bus.install_executor().expect("Failed to install the executor");
    assert!(bus.unique_name().starts_with(":1."));

    // first request owns the name, the second reports prior ownership
    let name = bus
        .request_name("org.test.A", 0)
        .await
        .expect("Failed to request a name");
    assert_eq!(name.name(), "org.test.A");

    let err = bus.request_name("org.test.A", 0).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyOwner(_)));

    // another connection cannot take it
    let other = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    other.install_executor().expect("Failed to install the executor");
    let err = other.request_name("org.test.A", 0).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyOwned(_)));

    assert!(bus.has_owner("org.test.A").await.unwrap());

    bus.release_name(name).await.expect("Failed to release");
    assert!(!bus.has_owner("org.test.A").await.unwrap());

    // released names are up for grabs again
    other
        .request_name("org.test.A", 0)
        .await
        .expect("Failed to re-request a released name");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_serials_increase_monotonically() {
    let fixture = Fixture::start();
    let bus = Bus::open(fixture.address()).expect("Failed to connect to the bus");

    let first = bus
        .send(Message::signal("/", "org.test.Iface", "Tick").unwrap())
        .expect("send");
    let second = bus
        .send(Message::signal("/", "org.test.Iface", "Tick").unwrap())
        .expect("send");

    assert!(first > 0);
    assert!(second > first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_match_rules_are_refcounted() {
    let fixture = Fixture::start();
    let bus = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    bus.install_executor().expect("Failed to install the executor");

    let rule = MatchRule::signal()
        .interface("org.test.Iface")
        .member("Changed");

    // two local references share one daemon-side registration
    bus.add_match(&rule).await.unwrap();
    bus.add_match(&rule).await.unwrap();
    assert_eq!(match_count(&bus, &rule).await, 1);

    // one removal keeps the rule active
    bus.remove_match(&rule).await.unwrap();
    assert_eq!(match_count(&bus, &rule).await, 1);

    bus.remove_match(&rule).await.unwrap();
    assert_eq!(match_count(&bus, &rule).await, 0);

    // removing an unknown rule is a no-op
    bus.remove_match(&rule).await.unwrap();
    assert_eq!(match_count(&bus, &rule).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stray_reply_is_dropped() {
    let fixture = Fixture::start();

    let target = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    target.install_executor().expect("Failed to install the executor");

    let sender = Bus::open(fixture.address()).expect("Failed to connect to the bus");

    // a reply correlated to a serial nobody is waiting on
    let mut fake_call =
        Message::method_call(target.unique_name(), "/", "org.test.Iface", "Gone").unwrap();
    fake_call.set_serial(0xDEAD_BEEF);
    fake_call.set_sender(target.unique_name());
    sender
        .send(Message::method_return(&fake_call))
        .expect("send stray reply");

    // the target connection keeps working
    let client = Bus::open(fixture.address()).expect("Failed to connect to the bus");
    client.install_executor().expect("Failed to install the executor");
    let proxy = Proxy::new(&client, target.unique_name(), "/")
        .expect("proxy")
        .with_timeout(Duration::from_secs(5));
    proxy.ping().await.expect("target still answers");
}
