use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use splunk_stream::cli::{format_row, row_to_json, Args, USAGE};
use splunk_stream::{Connection, SearchQuery};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    let (search, fields) = match args.required() {
        Ok(required) => required,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    let config = args.service_config()?;
    let request = args.search_request(search, fields)?;
    let connection = Arc::new(Connection::connect(config).await?);
    if let Some(reason) = connection.auth_error() {
        eprintln!("warning: not authenticated ({reason})");
    }

    let started = Instant::now();
    let mut cursor = SearchQuery::new(connection, request).cursor();

    let cancel = cursor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut count: u64 = 0;
    while let Some(row) = cursor.next_row().await {
        count += 1;
        if args.print {
            if args.json {
                println!("{}", row_to_json(cursor.schema(), &row));
            } else {
                println!("{}", format_row(cursor.schema(), &row));
            }
        }
    }

    if let Some(report) = cursor.report() {
        if let Some(error) = &report.error {
            eprintln!("search ended early: {error}");
        }
        if report.dropped > 0 {
            eprintln!("skipped {} malformed records", report.dropped);
        }
    }

    println!(
        "received {} results in {}ms",
        count,
        started.elapsed().as_millis()
    );
    Ok(())
}
