use std::net::IpAddr;
use clap::Parser;
use syncdrive::{App, Config};

const USAGE_EXAMPLE: &str =
    "Usage example: syncdrive --ip 192.168.1.101,192.168.1.102 --encryption yes";

// Words that turn encryption on; anything else disables it.
const AFFIRMATIVE: [&str; 4] = ["yes", "y", "true", "on"];

#[derive(Parser)]
struct Args {

    #[arg(long, value_delimiter = ',', required = true, help = "Comma-separated peer IPv4 addresses, no spaces")]
    ip: Vec<IpAddr>,

    #[arg(long, help = "Encrypt block payloads with the pre-shared key (yes/no)")]
    encryption: String,

}

#[tokio::main]
async fn main() {

    // Set up logging.
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(sub).expect("logging already initialised");

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("{}", USAGE_EXAMPLE);
            std::process::exit(1);
        }
    };

    let config = Config {
        peers: args.ip,
        encryption: AFFIRMATIVE.contains(&args.encryption.to_lowercase().as_str()),
        ..Config::default()
    };

    let mut app = App::new(config);
    if let Err(e) = app.run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
