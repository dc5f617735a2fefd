use log::LevelFilter;

use ferrobus_lib::{Bus, Proxy};

#[tokio::main]
async fn main() {
    pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Debug)
        .init();

    let bus = Bus::session().unwrap();
    bus.install_executor().unwrap();

    let proxy = Proxy::new(&bus, "com.examples.serve_object", "/com/examples/calc").unwrap();

    let (sum,): (i32,) = proxy
        .call("com.examples.Calc", "Add", (11i32, 31i32))
        .await
        .unwrap();

    println!("11 + 31 = {sum}");
}
