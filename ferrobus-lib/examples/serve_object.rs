use log::LevelFilter;

use ferrobus_lib::{Bus, Object};

#[tokio::main]
async fn main() {
    pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Debug)
        .init();

    let bus = Bus::session().unwrap();
    bus.install_executor().unwrap();

    let object = Object::new();
    object
        .register_method("com.examples.Calc", "Add", |(a, b): (i32, i32)| Ok((a + b,)))
        .unwrap();

    bus.register_object("/com/examples/calc", &object).unwrap();
    let _name = bus.request_name("com.examples.serve_object", 0).await.unwrap();

    let _ = tokio::signal::ctrl_c().await;
}
