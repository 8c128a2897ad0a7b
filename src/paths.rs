//! Deploy Directory Layout
//!
//! Resolves the raw/preview/ready data roots and the artifacts root, and
//! builds partition paths:
//!
//! ```text
//! deploy/
//!   data/ofi_cvd/raw/date=YYYY-MM-DD/hour=HH/symbol=SYM/kind=K/*.jsonl
//!   data/ofi_cvd/preview/...                (downsampled mirror)
//!   data/ofi_cvd/ready/{kind}/{symbol}/{YYYYMMDD}/{kind}-{YYYYMMDDTHH}[.part].jsonl
//!   artifacts/ofi_cvd/run_logs/run_manifest_{run_id}.json
//!   artifacts/ofi_cvd/source_manifest_{run_id}.json
//! ```

use crate::models::Millis;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Partitioned data kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Prices,
    Orderbook,
    Trades,
    Features,
    Signals,
    PnlDaily,
    Execlog,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Prices => "prices",
            DataKind::Orderbook => "orderbook",
            DataKind::Trades => "trades",
            DataKind::Features => "features",
            DataKind::Signals => "signals",
            DataKind::PnlDaily => "pnl_daily",
            DataKind::Execlog => "execlog",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prices" => Some(DataKind::Prices),
            "orderbook" => Some(DataKind::Orderbook),
            "trades" => Some(DataKind::Trades),
            "features" => Some(DataKind::Features),
            // Older harvesters wrote the singular form.
            "signals" | "signal" => Some(DataKind::Signals),
            "pnl_daily" => Some(DataKind::PnlDaily),
            "execlog" => Some(DataKind::Execlog),
            _ => None,
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key identifying one raw partition directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub date: NaiveDate,
    pub hour: u8,
    pub symbol: String,
    pub kind: DataKind,
}

impl PartitionKey {
    pub fn from_ts(ts_ms: Millis, symbol: &str, kind: DataKind) -> Self {
        let dt = utc_from_millis(ts_ms);
        Self {
            date: dt.date_naive(),
            hour: dt.hour() as u8,
            symbol: symbol.to_string(),
            kind,
        }
    }

    /// Relative partition directory: `date=…/hour=…/symbol=…/kind=…`.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(format!("date={}", self.date.format("%Y-%m-%d")))
            .join(format!("hour={:02}", self.hour))
            .join(format!("symbol={}", self.symbol))
            .join(format!("kind={}", self.kind))
    }
}

/// Resolved data/artifact roots under a deploy base directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub raw_root: PathBuf,
    pub preview_root: PathBuf,
    pub ready_root: PathBuf,
    pub artifacts_root: PathBuf,
}

impl DataPaths {
    pub fn new(base: &Path) -> Self {
        let data = base.join("data").join("ofi_cvd");
        let artifacts = base.join("artifacts").join("ofi_cvd");
        Self {
            raw_root: data.join("raw"),
            preview_root: data.join("preview"),
            ready_root: data.join("ready"),
            artifacts_root: artifacts,
        }
    }

    pub fn raw_partition(&self, key: &PartitionKey) -> PathBuf {
        self.raw_root.join(key.relative_dir())
    }

    pub fn preview_partition(&self, key: &PartitionKey) -> PathBuf {
        self.preview_root.join(key.relative_dir())
    }

    /// Directory holding ready files for one (kind, symbol, day).
    pub fn ready_dir(&self, kind: DataKind, symbol: &str, ts_ms: Millis) -> PathBuf {
        let day = utc_from_millis(ts_ms).format("%Y%m%d").to_string();
        self.ready_root.join(kind.as_str()).join(symbol).join(day)
    }

    pub fn run_manifest_path(&self, run_id: &str) -> PathBuf {
        self.artifacts_root
            .join("run_logs")
            .join(format!("run_manifest_{}.json", run_id))
    }

    pub fn source_manifest_path(&self, run_id: &str) -> PathBuf {
        self.artifacts_root
            .join(format!("source_manifest_{}.json", run_id))
    }
}

/// Hour stamp used in ready file names: `YYYYMMDDTHH`.
pub fn hour_stamp(ts_ms: Millis) -> String {
    utc_from_millis(ts_ms).format("%Y%m%dT%H").to_string()
}

/// Final ready file name for an hour bucket.
pub fn ready_file_name(kind: DataKind, ts_ms: Millis) -> String {
    format!("{}-{}.jsonl", kind.as_str(), hour_stamp(ts_ms))
}

/// In-progress ready file name; promoted by atomic rename on rotation.
pub fn ready_part_name(kind: DataKind, ts_ms: Millis) -> String {
    format!("{}-{}.part.jsonl", kind.as_str(), hour_stamp(ts_ms))
}

pub(crate) fn utc_from_millis(ts_ms: Millis) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_else(|| {
        DateTime::<Utc>::from_timestamp_millis(0).expect("epoch is representable")
    })
}
