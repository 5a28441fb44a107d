use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "movie-catalog-server")]
#[command(about = "Movie catalog aggregation service", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "movie-catalog.yaml")]
    config: String,
    /// Log at debug level for this crate
    #[arg(short, long)]
    debug: bool,
    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_filter = if args.debug {
        "movie_catalog=debug,tower_http=info"
    } else {
        "movie_catalog=info,tower_http=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Err(e) = movie_catalog::run(&args.config, args.debug).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
