//! Bar loading from CSV files
//!
//! Rows are `datetime,open,high,low,close,volume`, in ascending datetime
//! order, amounts parsed as exact decimals.

use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;

use crate::dispatcher::{BarEvent, EventSource};
use crate::types::{Bar, Pair};

/// Load OHLCV bars for one pair from a CSV file.
pub fn load_bars_csv(path: impl AsRef<Path>, pair: &Pair) -> Result<Vec<Bar>> {
    let reader = csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;
    read_bars(reader, pair)
}

fn read_bars<R: Read>(mut reader: csv::Reader<R>, pair: &Pair) -> Result<Vec<Bar>> {
    let mut bars = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.context(format!("Failed to read row {}", row_idx + 1))?;

        let dt_str = record.get(0).context("Missing datetime column")?;
        let datetime = dt_str
            .parse::<DateTime<Utc>>()
            .or_else(|_| {
                // Try parsing without timezone and assume UTC
                NaiveDateTime::parse_from_str(dt_str, "%Y-%m-%d %H:%M:%S")
                    .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
            })
            .context(format!("Failed to parse datetime: {}", dt_str))?;

        bars.push(Bar {
            pair: pair.clone(),
            datetime,
            open: decimal_column(&record, 1, "open")?,
            high: decimal_column(&record, 2, "high")?,
            low: decimal_column(&record, 3, "low")?,
            close: decimal_column(&record, 4, "close")?,
            volume: decimal_column(&record, 5, "volume")?,
        });
    }

    Ok(bars)
}

fn decimal_column(record: &csv::StringRecord, idx: usize, name: &str) -> Result<Decimal> {
    record
        .get(idx)
        .context(format!("Missing {} column", name))?
        .trim()
        .parse()
        .context(format!("Failed to parse {}", name))
}

/// Event source yielding a pair's bars loaded from a CSV file.
pub struct CsvBarSource {
    events: VecDeque<BarEvent>,
}

impl CsvBarSource {
    pub fn new(pair: Pair, path: impl AsRef<Path>) -> Result<Self> {
        let bars = load_bars_csv(path, &pair)?;
        Ok(CsvBarSource {
            events: bars.into_iter().map(BarEvent::new).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventSource for CsvBarSource {
    fn peek_next(&self) -> Option<DateTime<Utc>> {
        self.events.front().map(BarEvent::when)
    }

    fn pop(&mut self) -> Option<BarEvent> {
        self.events.pop_front()
    }
}
