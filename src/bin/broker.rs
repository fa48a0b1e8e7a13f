use clap::{App, Arg};
use tankbus::bus::Broker;
use tankbus::transport::relay::serve;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN: &str = "127.0.0.1:1883";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("tank-broker")
        .version("0.1.0")
        .author("Tank Systems Engineering Team")
        .about("📮 Publish/subscribe relay for tanks and controllers")
        .arg(
            Arg::with_name("listen")
                .short("l")
                .long("listen")
                .value_name("HOST:PORT")
                .help("Address to listen on")
                .takes_value(true)
                .default_value(DEFAULT_LISTEN),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log every routed message"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("📮 Tank Bus Broker");
    println!("==================");

    let listen = matches.value_of("listen").unwrap_or(DEFAULT_LISTEN);
    let listener = TcpListener::bind(listen).await?;
    info!("🌐 Broker listening on {}", listen);

    let broker = Broker::new();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = serve(listener, broker.clone()) => {}
    }

    println!("📮 Broker stopped ({} sessions open)", broker.session_count());
    Ok(())
}
