//! Multi-Leg Engine - Main Entry Point
//!
//! Paper-trading CLI that drives the triangle orchestrator and the close
//! strategies against simulated exchanges.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use multileg_engine::close::{CloseOptions, StrategyFactory};
use multileg_engine::config::Config;
use multileg_engine::exchange::{
    ExchangeConnector, LimitFillMode, MockExchange, PositionSide, PushEvent, PushFeed,
    SymbolLimits,
};
use multileg_engine::persistence::{MemoryStore, OpportunitySource, PositionStore, SqliteStore};
use multileg_engine::triangle::{
    ExecutionRequest, SymbolLimitsCache, TriangleCalculator, TriangleOpportunity,
    TriangleOrchestrator, TriangularPosition,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Multi-Leg Engine CLI
#[derive(Parser)]
#[command(name = "multileg-engine")]
#[command(version, about = "Triangular execution and safe hedge closing (paper trading)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a triangle on a simulated exchange
    DemoTriangle {
        /// Entry size in the quote asset
        #[arg(short, long, default_value = "100")]
        size: Decimal,

        /// Persist the position to this SQLite database
        #[arg(long)]
        db: Option<String>,

        /// Make every attempt of this leg (1-3) fail to exercise reversal
        #[arg(long)]
        fail_leg: Option<u8>,
    },

    /// Close a simulated hedged position
    DemoClose {
        /// Primary exchange name (selects the close strategy)
        #[arg(long, default_value = "binance")]
        primary: String,

        /// Hedge exchange name
        #[arg(long, default_value = "bybit")]
        hedge: String,

        /// Position size on each leg
        #[arg(short, long, default_value = "1")]
        quantity: Decimal,

        /// Leave close limit orders resting so the timeout path runs
        #[arg(long)]
        unfilled: bool,
    },

    /// List persisted triangular positions
    Status {
        /// Path to SQLite database (default: configured db_path)
        #[arg(short, long)]
        db: Option<String>,

        /// Only positions of this user
        #[arg(short, long)]
        user: Option<String>,

        /// Show per-leg details
        #[arg(short, long)]
        verbose: bool,
    },

    /// Cancel a persisted position that has not completed
    Cancel {
        /// Position id
        position_id: String,

        /// Path to SQLite database (default: configured db_path)
        #[arg(short, long)]
        db: Option<String>,
    },

    /// Stream live push prices from a public exchange feed
    WatchPrices {
        /// binance or bybit
        #[arg(short, long, default_value = "binance")]
        exchange: String,

        /// Symbols to watch
        #[arg(short, long, num_args = 1.., default_value = "BTCUSDT")]
        symbols: Vec<String>,

        /// Stop after this many seconds
        #[arg(long, default_value = "30")]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Commands::DemoTriangle { size, db, fail_leg } => {
            demo_triangle(&config, size, db.as_deref(), fail_leg).await
        }
        Commands::DemoClose {
            primary,
            hedge,
            quantity,
            unfilled,
        } => demo_close(&config, &primary, &hedge, quantity, unfilled).await,
        Commands::Status { db, user, verbose } => {
            let db = db.unwrap_or_else(|| config.persistence.db_path.clone());
            show_status(&db, user.as_deref(), verbose).await
        }
        Commands::Cancel { position_id, db } => {
            let db = db.unwrap_or_else(|| config.persistence.db_path.clone());
            cancel(&config, &db, &position_id).await
        }
        Commands::WatchPrices {
            exchange,
            symbols,
            seconds,
        } => watch_prices(&exchange, &symbols, seconds).await,
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "multileg-engine.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("multileg_engine=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Paper exchange with an ETH/BTC/USDT triangle priced slightly in favour
/// of the forward route.
fn paper_triangle_exchange(fail_leg: Option<u8>, max_attempts: u32) -> MockExchange {
    let exchange = MockExchange::new("bybit");
    let limits = |qty_step, min_notional| SymbolLimits {
        min_order_qty: qty_step,
        min_notional,
        qty_step,
        price_step: dec!(0.01),
    };
    exchange.add_market("ETHUSDT", "ETH", "USDT", dec!(3000), limits(dec!(0.0001), dec!(5)));
    exchange.add_market("ETHBTC", "ETH", "BTC", dec!(0.05), limits(dec!(0.0001), dec!(0.00001)));
    exchange.add_market("BTCUSDT", "BTC", "USDT", dec!(60600), limits(dec!(0.000001), dec!(5)));
    exchange.set_balance("USDT", dec!(10000));

    if let Some(leg) = fail_leg {
        let symbol = match leg {
            1 => "ETHUSDT",
            2 => "ETHBTC",
            _ => "BTCUSDT",
        };
        exchange.fail_market_orders(symbol, max_attempts as usize, "Order would exceed price band");
    }
    exchange
}

fn paper_opportunity() -> TriangleOpportunity {
    TriangleOpportunity {
        id: format!("opp-{}", Utc::now().timestamp_millis()),
        exchange: "bybit".to_string(),
        symbols: ["ETHUSDT".to_string(), "ETHBTC".to_string(), "BTCUSDT".to_string()],
        base_asset: "ETH".to_string(),
        quote_asset: "USDT".to_string(),
        bridge_asset: "BTC".to_string(),
        expected_profit_pct: dec!(0.7),
        consumed: false,
        discovered_at: Utc::now(),
    }
}

async fn demo_triangle(
    config: &Config,
    size: Decimal,
    db: Option<&str>,
    fail_leg: Option<u8>,
) -> Result<()> {
    let exchange = Arc::new(paper_triangle_exchange(fail_leg, config.triangle.max_attempts));
    let opportunity = paper_opportunity();

    let (store, opportunities): (Arc<dyn PositionStore>, Arc<dyn OpportunitySource>) = match db {
        Some(path) => {
            if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let store = Arc::new(SqliteStore::new(path)?);
            store.insert_opportunity(&opportunity)?;
            let positions: Arc<dyn PositionStore> = store.clone();
            let opportunities: Arc<dyn OpportunitySource> = store;
            (positions, opportunities)
        }
        None => {
            let store = Arc::new(MemoryStore::new());
            store.insert_opportunity(opportunity.clone()).await;
            let positions: Arc<dyn PositionStore> = store.clone();
            let opportunities: Arc<dyn OpportunitySource> = store;
            (positions, opportunities)
        }
    };

    let orchestrator = TriangleOrchestrator::new(
        exchange.clone(),
        store,
        opportunities,
        Arc::new(TriangleCalculator::new(
            config.triangle.estimated_fee_rate,
            config.triangle.min_profit_pct,
        )),
        Arc::new(SymbolLimitsCache::new()),
        config.triangle.clone(),
    );

    let request = ExecutionRequest {
        user_id: "paper".to_string(),
        position_size: size,
        max_slippage_pct: dec!(1),
        execution_timeout_secs: None,
        credential_ref: None,
    };

    info!(opportunity = %opportunity.id, %size, "Executing paper triangle");
    match orchestrator.execute_opportunity(&opportunity.id, request).await {
        Ok(position) => print_position(&position, true),
        Err(e) if e.is_pre_trade() => warn!(error = %e, "Triangle rejected before trading"),
        Err(e) => {
            error!(error = %e, "Triangle execution failed");
            for position in orchestrator.list_positions("paper").await? {
                print_position(&position, true);
            }
        }
    }

    println!("\n💰 Balances after execution");
    for asset in ["USDT", "ETH", "BTC"] {
        println!("   ├─ {}: {}", asset, exchange.balance(asset).round_dp(8));
    }
    Ok(())
}

async fn demo_close(
    config: &Config,
    primary_name: &str,
    hedge_name: &str,
    quantity: Decimal,
    unfilled: bool,
) -> Result<()> {
    let fill = if unfilled {
        LimitFillMode::Rest
    } else {
        LimitFillMode::Fill
    };
    let venue = |name: &str, position: Decimal| {
        let exchange = MockExchange::new(name).with_push().with_limit_fill(fill);
        exchange.add_market(
            "BTCUSDT",
            "BTC",
            "USDT",
            dec!(60000),
            SymbolLimits {
                min_order_qty: dec!(0.001),
                min_notional: dec!(5),
                qty_step: dec!(0.001),
                price_step: dec!(0.1),
            },
        );
        exchange.set_position("BTCUSDT", position);
        Arc::new(exchange)
    };
    let primary = venue(primary_name, quantity);
    let hedge = venue(hedge_name, -quantity);

    let factory = StrategyFactory::new(config.close.clone());
    // Paper venues have no live feed; seed the push cache as a tick would
    for exchange in [&primary, &hedge] {
        factory
            .price_cache()
            .update(&exchange.exchange_name(), "BTCUSDT", dec!(60000));
    }

    let strategy = factory.select_strategy(primary.clone(), hedge.clone());
    info!(
        strategy = strategy.name(),
        avg_close_time_ms = strategy.avg_close_time_ms(),
        "Closing paper hedge"
    );

    let options = CloseOptions::new("BTCUSDT", "BTCUSDT", PositionSide::Long, quantity);
    let result = strategy.close_positions(&options).await;

    println!("\n🔒 Close result ({})", result.strategy);
    println!("   ├─ Success:        {}", result.success);
    println!(
        "   ├─ Primary:        closed={} exit={:?} fee={:?}",
        result.primary_closed, result.primary_exit_price, result.primary_fee_type
    );
    println!(
        "   ├─ Hedge:          closed={} exit={:?} fee={:?}",
        result.hedge_closed, result.hedge_exit_price, result.hedge_fee_type
    );
    println!("   ├─ Elapsed:        {}ms", result.elapsed_ms);
    if let Some(error) = &result.error {
        println!("   ├─ Error:          {}", error);
        println!("   ├─ Still open:     {}", result.remaining_open.join(", "));
    }
    println!(
        "   └─ Market orders:  {}",
        primary.market_order_count() + hedge.market_order_count()
    );
    Ok(())
}

async fn show_status(db_path: &str, user: Option<&str>, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              TRIANGULAR POSITIONS                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        return Ok(());
    }

    let store = SqliteStore::new(db_path)?;
    let positions = store.list_positions(user).await?;
    if positions.is_empty() {
        println!("\n   No positions recorded.");
        return Ok(());
    }

    for position in &positions {
        print_position(position, verbose);
    }
    println!();
    Ok(())
}

async fn cancel(config: &Config, db_path: &str, position_id: &str) -> Result<()> {
    let store = Arc::new(
        SqliteStore::new(db_path).with_context(|| format!("Failed to open {}", db_path))?,
    );
    let exchange = store
        .get_position(position_id)
        .await?
        .map(|p| p.exchange)
        .unwrap_or_else(|| "bybit".to_string());

    let orchestrator = TriangleOrchestrator::new(
        Arc::new(MockExchange::new(exchange)),
        store.clone(),
        store,
        Arc::new(TriangleCalculator::default()),
        Arc::new(SymbolLimitsCache::new()),
        config.triangle.clone(),
    );

    let position = orchestrator.cancel_position(position_id).await?;
    print_position(&position, false);
    Ok(())
}

async fn watch_prices(exchange: &str, symbols: &[String], seconds: u64) -> Result<()> {
    let feed = match exchange.to_ascii_lowercase().as_str() {
        "binance" => PushFeed::binance_mark_prices(symbols),
        "bybit" => PushFeed::bybit_tickers(symbols),
        other => anyhow::bail!("no public price feed for {}", other),
    };
    let feed = Arc::new(feed);
    let mut rx = feed.subscribe();
    let handle = feed.clone().connect().await?;

    let watch = async {
        loop {
            match rx.recv().await {
                Ok(PushEvent::Price(update)) => {
                    println!("{} {} {}", Utc::now().format("%H:%M:%S%.3f"), update.symbol, update.price);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Price output lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    if tokio::time::timeout(Duration::from_secs(seconds), watch)
        .await
        .is_err()
    {
        info!(seconds, "Watch period over");
    }
    handle.abort();
    Ok(())
}

fn print_position(position: &TriangularPosition, verbose: bool) {
    println!("\n🔺 {} [{}]", position.id, position.status);
    println!(
        "   ├─ {} {} via {}/{}/{}",
        position.exchange,
        position.direction,
        position.symbols[0],
        position.symbols[1],
        position.symbols[2]
    );
    println!(
        "   ├─ Entry:          {} {}",
        position.entry_qty, position.quote_asset
    );
    println!(
        "   ├─ Expected:       {} ({:+.4}%)",
        position.expected_return_qty.round_dp(8),
        position.expected_profit_pct
    );
    if let Some(results) = &position.results {
        println!(
            "   ├─ Final:          {} ({:+.4}%)",
            results.final_qty.round_dp(8),
            results.actual_profit_pct
        );
        println!("   ├─ Fees:           {}", results.total_fees.round_dp(8));
    }
    if let Some(message) = &position.error_message {
        println!("   ├─ Error:          {}", message);
    }
    if verbose {
        for leg in position.completed_legs() {
            println!(
                "   ├─ Leg {}: {} {} {} @ {} -> {} (fee {})",
                leg.leg,
                leg.side,
                leg.filled_qty,
                leg.symbol,
                leg.avg_price,
                leg.output_amount.round_dp(8),
                leg.fees
            );
        }
    }
    println!(
        "   └─ Started:        {}",
        position.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
}
