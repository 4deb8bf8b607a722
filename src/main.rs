use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{error, info};

use lobcast_rs::config::RelayConfig;
use lobcast_rs::relay::Relay;
use lobcast_rs::telemetry;
use lobcast_rs::upstream::deribit::{Credentials, DeribitClient, OrderDirection, OrderRequest};

#[derive(Parser, Debug)]
#[command(name = "lobcast", version, about = "Deribit order-book relay and trading CLI")]
struct Cli {
    /// Config file path; defaults to ./lobcast.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the websocket relay.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        poll_interval_secs: Option<u64>,
        #[arg(long)]
        book_depth: Option<u32>,
    },
    /// Acquire (or reuse) a bearer token and print it.
    Auth,
    /// Fetch one order-book snapshot.
    Book {
        instrument: String,
        #[arg(long)]
        depth: Option<u32>,
    },
    /// Place an order.
    Order {
        #[arg(value_enum)]
        direction: Direction,
        instrument: String,
        amount: u64,
        /// Deribit order type, e.g. market or limit.
        #[arg(long, default_value = "market")]
        order_type: String,
        /// Optional client-side label for the order.
        #[arg(long)]
        label: Option<String>,
    },
    /// Edit an open order.
    Edit {
        order_id: String,
        amount: u64,
        price: f64,
        /// Advanced order option, e.g. implv.
        #[arg(long)]
        advanced: Option<String>,
    },
    /// Cancel an open order.
    Cancel { order_id: String },
    /// List positions.
    Positions {
        currency: String,
        #[arg(long, default_value = "future")]
        kind: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Direction {
    Buy,
    Sell,
}

impl From<Direction> for OrderDirection {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Buy => OrderDirection::Buy,
            Direction::Sell => OrderDirection::Sell,
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    telemetry::init_tracing("info");

    if let Err(e) = run(Cli::parse()).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut cfg = RelayConfig::load(cli.config.as_deref()).context("load configuration")?;

    match cli.cmd {
        Cmd::Serve {
            port,
            poll_interval_secs,
            book_depth,
        } => {
            if let Some(port) = port {
                cfg.port = port;
            }
            if let Some(secs) = poll_interval_secs {
                cfg.poll_interval_secs = secs;
            }
            if let Some(depth) = book_depth {
                cfg.book_depth = depth;
            }
            telemetry::init_metrics(cfg.metrics_port);

            let source = Arc::new(DeribitClient::new(cfg.api_base.clone()));
            let relay = Relay::new(cfg, source);
            tokio::select! {
                served = relay.run() => served.context("relay stopped")?,
                _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
            }
        }
        Cmd::Auth => {
            let client = private_client(&cfg)?;
            println!("{}", client.bearer_token().await?);
        }
        Cmd::Book { instrument, depth } => {
            let client = DeribitClient::new(cfg.api_base.clone());
            let raw = client
                .order_book_raw(&instrument, depth.unwrap_or(cfg.book_depth))
                .await?;
            println!("{}", pretty_raw(&raw));
        }
        Cmd::Order {
            direction,
            instrument,
            amount,
            order_type,
            label,
        } => {
            let order = OrderRequest {
                instrument_name: instrument,
                amount,
                kind: order_type,
                label,
            };
            let response = private_client(&cfg)?
                .place_order(direction.into(), &order)
                .await?;
            print_json(&response);
        }
        Cmd::Edit {
            order_id,
            amount,
            price,
            advanced,
        } => {
            let response = private_client(&cfg)?
                .edit_order(&order_id, amount, price, advanced.as_deref())
                .await?;
            print_json(&response);
        }
        Cmd::Cancel { order_id } => {
            let response = private_client(&cfg)?.cancel_order(&order_id).await?;
            print_json(&response);
        }
        Cmd::Positions { currency, kind } => {
            let response = private_client(&cfg)?.positions(&currency, &kind).await?;
            print_json(&response);
        }
    }

    Ok(())
}

fn private_client(cfg: &RelayConfig) -> anyhow::Result<DeribitClient> {
    let credentials =
        Credentials::from_env().context("CLIENT_ID / API_KEY environment variables not set")?;
    Ok(DeribitClient::new(cfg.api_base.clone()).with_credentials(credentials))
}

fn pretty_raw(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(v) => serde_json::to_string_pretty(&v).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}

fn print_json(v: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
    );
}
