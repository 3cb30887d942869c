use std::time::Duration;

use ca_engine::{
    ClientContext,
    dbr::{DbrCategory, DbrValue},
};
use clap::Parser;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
struct Options {
    /// PV to write to
    #[clap(id = "PV_NAME")]
    name: String,
    /// New value. Several values write an array.
    #[clap(required = true)]
    values: Vec<String>,
    /// Seconds to wait for the channel to connect
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
    let channel = client.open(&opts.name);
    if let Err(e) = client
        .wait_connected(channel, Duration::from_secs_f64(opts.timeout))
        .await
    {
        eprintln!("{}: not connected: {e}", opts.name);
        std::process::exit(1);
    }
    let old = client.get_dbr(channel, DbrCategory::Basic).await;

    // Servers convert strings to the native type
    match client.put(channel, DbrValue::String(opts.values)).await {
        Ok(()) => {
            if let Ok(old) = old {
                println!("Old : {:<30} {}", opts.name, old.value());
            }
            match client.get_dbr(channel, DbrCategory::Basic).await {
                Ok(new) => println!("New : {:<30} {}", opts.name, new.value()),
                Err(e) => println!("New : {:<30} *** read failed: {e}", opts.name),
            }
        }
        Err(e) => {
            eprintln!("{}: write failed: {e}", opts.name);
            std::process::exit(1);
        }
    }
    client.shutdown();
}
