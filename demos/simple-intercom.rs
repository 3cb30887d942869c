use std::time::Duration;

use ca_engine::{ServerBuilder, providers::IntercomProvider};
use clap::Parser;
use tokio::select;
use tracing::{info, level_filters::LevelFilter};

#[derive(Parser)]
struct Options {
    /// Prefix for every served name
    #[clap(long, default_value = "")]
    prefix: String,
    /// Only notify subscribers of changes bigger than this
    #[clap(long, default_value_t = 0.0)]
    deadband: f64,
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
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        })
        .init();

    let provider = IntercomProvider::new()
        .with_prefix(&opts.prefix)
        .with_rbv(true);
    let value = provider
        .add_pv("NUMERIC_VALUE", 42i32)
        .unwrap()
        .with_deadband(opts.deadband);
    let _waveform = provider
        .add_pv("WAVEFORM", vec![0i16, 1, 2, 4, 5])
        .unwrap()
        .with_minimum_length(10);
    let _filename = provider
        .add_pv("FILENAME", "c:\\some_file.cif".to_string())
        .unwrap()
        .with_record_type("stringin");

    let server = ServerBuilder::new(provider).start().await.unwrap();

    loop {
        select! {
            _ = tokio::time::sleep(Duration::from_secs(3)) => (),
            _ = tokio::signal::ctrl_c() => {
                println!("Ctrl-C: Shutting down");
                break;
            },
        };

        let next = value.load() + 1;
        info!("Updating value to {next}");
        value.store(next);
    }
    // Wait for shutdown, unless another ctrl-c
    select! {
        _ = server.stop() => (),
        _ = tokio::signal::ctrl_c() => println!("Terminating"),
    };
}
