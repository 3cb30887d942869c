use ca_engine::{
    ClientContext,
    client::ConnectionEvent,
    dbr::DbrCategory,
    messages::MonitorMask,
};
use clap::Parser;
use tokio::select;
use tokio_stream::StreamExt;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Options {
    /// PV name to monitor
    #[clap(required = true, id = "PV_NAME")]
    name: String,
    /// Also report alarm changes
    #[clap(short, long)]
    alarms: bool,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();

    let filter = EnvFilter::default()
        .add_directive(
            match opts.verbose {
                0 => LevelFilter::INFO,
                1 => LevelFilter::DEBUG,
                2.. => LevelFilter::TRACE,
            }
            .into(),
        )
        .add_directive("tokio=off".parse().unwrap())
        .add_directive("runtime=off".parse().unwrap());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_filter(filter);
    tracing_subscriber::registry().with(fmt_layer).init();

    let client = ClientContext::new().await.unwrap();
    let name = opts.name.clone();
    let channel = client.open_with_listener(&opts.name, move |event| match event {
        ConnectionEvent::Connected(info) => {
            info!("{name} connected to {} ({} x {:?})", info.server, info.native_count, info.native_type)
        }
        ConnectionEvent::Disconnected => println!("{name} *** disconnected"),
        ConnectionEvent::AccessRightsChanged(access) => info!("{name} access is now {access}"),
        ConnectionEvent::CreateFailed => println!("{name} *** server refused the channel"),
    });
    let mask = if opts.alarms {
        MonitorMask::VALUE | MonitorMask::ALARM
    } else {
        MonitorMask::VALUE
    };
    let mut monitor = client.monitor(channel, DbrCategory::Time, mask).unwrap();

    loop {
        select! {
            update = monitor.next() => match update {
                Some(Ok(dbr)) => {
                    let timestamp = dbr
                        .timestamp()
                        .map(|t| format!("{t:?}"))
                        .unwrap_or_default();
                    println!("{} {timestamp} {}", opts.name, dbr.value());
                }
                Some(Err(e)) => println!("{} *** {e}", opts.name),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    drop(monitor);
    client.shutdown();
    info!("Disconnected.");
}
