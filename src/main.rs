//! Demo backtest: SMA crossover on CSV bars against the simulated exchange

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use itertools::Itertools;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use ta::indicators::SimpleMovingAverage;
use ta::Next;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use backtest_exchange::data::CsvBarSource;
use backtest_exchange::math;
use backtest_exchange::{
    BarEvent, EventDispatcher, Exchange, OrderOperation, Pair, PairInfo, Symbol,
};

#[derive(Parser, Debug)]
#[command(name = "backtest-exchange")]
#[command(about = "Run an SMA-crossover backtest against the simulated exchange", long_about = None)]
#[command(version)]
struct Cli {
    /// CSV file with datetime,open,high,low,close,volume rows
    #[arg(short, long)]
    csv: PathBuf,

    /// Base symbol
    #[arg(long, default_value = "BTC")]
    base: String,

    /// Quote symbol
    #[arg(long, default_value = "USDT")]
    quote: String,

    /// Initial quote balance
    #[arg(long, default_value = "10000")]
    capital: Decimal,

    /// Fast SMA period
    #[arg(long, default_value = "12")]
    fast: usize,

    /// Slow SMA period
    #[arg(long, default_value = "26")]
    slow: usize,

    /// Fraction of the available balance used per entry, in percent
    #[arg(long, default_value = "95")]
    position_pct: Decimal,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Buys when the fast SMA crosses above the slow one, sells everything when
/// it crosses back below.
struct SmaCrossover {
    exchange: Exchange,
    pair: Pair,
    position_pct: Decimal,
    fast: SimpleMovingAverage,
    slow: SimpleMovingAverage,
    warmup: usize,
    bars_seen: usize,
    above: Option<bool>,
}

impl SmaCrossover {
    fn new(
        exchange: Exchange,
        pair: Pair,
        position_pct: Decimal,
        fast_period: usize,
        slow_period: usize,
    ) -> Result<Self> {
        Ok(SmaCrossover {
            exchange,
            pair,
            position_pct,
            fast: SimpleMovingAverage::new(fast_period)
                .map_err(|e| anyhow::anyhow!("invalid fast SMA period: {:?}", e))?,
            slow: SimpleMovingAverage::new(slow_period)
                .map_err(|e| anyhow::anyhow!("invalid slow SMA period: {:?}", e))?,
            warmup: slow_period,
            bars_seen: 0,
            above: None,
        })
    }

    fn on_bar_event(&mut self, event: &BarEvent) -> Result<()> {
        let close = event
            .bar
            .close
            .to_f64()
            .context("close does not fit in an f64")?;
        let fast = self.fast.next(close);
        let slow = self.slow.next(close);
        self.bars_seen += 1;
        if self.bars_seen < self.warmup {
            return Ok(());
        }

        let above = fast > slow;
        let crossed = self.above.map_or(false, |prev| prev != above);
        self.above = Some(above);
        if !crossed {
            return Ok(());
        }

        if above {
            self.enter()
        } else {
            self.exit()
        }
    }

    fn enter(&self) -> Result<()> {
        let balance = self.exchange.get_balance(&self.pair.quote_symbol);
        let (_, ask) = self.exchange.get_bid_ask(&self.pair);
        let Some(ask) = ask else { return Ok(()) };

        let pair_info = self.exchange.get_pair_info(&self.pair);
        let amount = math::truncate_decimal(
            balance.available * self.position_pct / dec!(100) / ask,
            pair_info.base_precision,
        );
        if amount.is_zero() {
            return Ok(());
        }

        info!("Golden cross: buying {} {}", amount, self.pair.base_symbol);
        self.exchange
            .create_market_order(OrderOperation::Buy, self.pair.clone(), amount)?;
        Ok(())
    }

    fn exit(&self) -> Result<()> {
        let balance = self.exchange.get_balance(&self.pair.base_symbol);
        let pair_info = self.exchange.get_pair_info(&self.pair);
        let amount = math::truncate_decimal(balance.available, pair_info.base_precision);
        if amount.is_zero() {
            return Ok(());
        }

        info!("Death cross: selling {} {}", amount, self.pair.base_symbol);
        self.exchange
            .create_market_order(OrderOperation::Sell, self.pair.clone(), amount)?;
        Ok(())
    }
}

fn setup_logging(verbose: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;
    let log_filename = format!(
        "backtest_{}.log",
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(true);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    ensure!(
        cli.fast < cli.slow,
        "fast period must be shorter than slow period"
    );

    let pair = Pair::new(Symbol::new(cli.base), Symbol::new(cli.quote));
    let dispatcher = EventDispatcher::new();
    let exchange = Exchange::new(
        &dispatcher,
        HashMap::from([(pair.quote_symbol.clone(), cli.capital)]),
    );
    exchange.set_pair_info(pair.clone(), PairInfo::new(8, 2));

    let strategy = Rc::new(RefCell::new(SmaCrossover::new(
        exchange.clone(),
        pair.clone(),
        cli.position_pct,
        cli.fast,
        cli.slow,
    )?));
    exchange.subscribe_to_bar_events(
        pair.clone(),
        Box::new(move |event| strategy.borrow_mut().on_bar_event(event)),
    );

    let source = CsvBarSource::new(pair.clone(), &cli.csv)
        .context(format!("Failed to load bars from {}", cli.csv.display()))?;
    info!("Loaded {} bars from {}", source.len(), cli.csv.display());
    exchange.add_bar_source(source);

    dispatcher.run();

    for (symbol, balance) in exchange
        .get_balances()
        .into_iter()
        .sorted_by(|a, b| a.0.as_str().cmp(b.0.as_str()))
    {
        info!(
            "{} balance: available={} total={}",
            symbol, balance.available, balance.total
        );
    }
    Ok(())
}
