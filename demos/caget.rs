use std::time::Duration;

use ca_engine::{ClientContext, dbr::DbrCategory};
use clap::Parser;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
struct Options {
    /// PV names to read
    #[clap(required = true, id = "PV_NAME")]
    names: Vec<String>,
    /// Fetch alarm status and timestamp with the value
    #[clap(short, long)]
    time: bool,
    /// Seconds to wait for each channel to connect
    #[clap(short = 'w', default_value_t = 1.0)]
    timeout: f64,
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

    tracing_subscriber::fmt()
        .with_max_level(match opts.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        })
        .init();

    let client = ClientContext::new().await.unwrap();
    let category = if opts.time {
        DbrCategory::Time
    } else {
        DbrCategory::Basic
    };
    // Open everything up front so the searches go out together
    let channels: Vec<_> = opts.names.iter().map(|name| client.open(name)).collect();
    let timeout = Duration::from_secs_f64(opts.timeout);

    for (name, channel) in opts.names.iter().zip(channels) {
        if let Err(e) = client.wait_connected(channel, timeout).await {
            println!("{name:<30} *** not connected: {e}");
            continue;
        }
        match client.get_dbr(channel, category).await {
            Ok(dbr) => match (dbr.timestamp(), dbr.status()) {
                (Some(timestamp), Some(status)) => println!(
                    "{name:<30} {:?} {} (status {} severity {})",
                    timestamp,
                    dbr.value(),
                    status.status,
                    status.severity
                ),
                _ => println!("{name:<30} {}", dbr.value()),
            },
            Err(e) => println!("{name:<30} *** read failed: {e}"),
        }
    }
    client.shutdown();
}
