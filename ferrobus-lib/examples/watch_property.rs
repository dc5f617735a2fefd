use log::{LevelFilter, *};

use ferrobus_lib::{Bus, Proxy};

#[tokio::main]
async fn main() {
    pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Debug)
        .init();

    let bus = Bus::session().unwrap();
    bus.install_executor().unwrap();

    let proxy = Proxy::new(&bus, "com.examples.serve_object", "/com/examples/calc").unwrap();
    let level = proxy
        .property::<u32>("com.examples.Calc", "Level", false)
        .unwrap();

    level
        .subscribe(|value| debug!("Level changed: {value}"))
        .await
        .unwrap();

    println!("Current level: {}", level.get().await.unwrap());

    let _ = tokio::signal::ctrl_c().await;
}
