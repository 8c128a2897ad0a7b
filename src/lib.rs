//! AlphaFlow Backend Library
//!
//! Real-time order-flow feature and signal pipeline for crypto futures:
//! per-second alignment, OFI/CVD fusion, the gating/confirm state machine,
//! dual JSONL/SQLite signal sinks, and a deterministic backtest executor.

pub mod aligner;
pub mod backtest;
pub mod config;
pub mod core_algorithm;
pub mod engine;
pub mod events;
pub mod features;
pub mod models;
pub mod paths;
pub mod signal;
pub mod sink;
pub mod strategy;


// Re-export the decision-stack types binaries and tests reach for most.
pub use aligner::{align, Aligner, AlignerStats};
pub use config::{Config, InputMode, SinkChoice};
pub use core_algorithm::CoreAlgorithm;
pub use engine::{EngineReport, EngineStats, PipelineEngine};
pub use models::{AlignedFeatureRow, QualityTier, Regime, Scenario2x2, SideHint, SignalType};
pub use signal::{DecisionCode, SignalV2, HARD_GUARDS, SOFT_GUARDS};
pub use strategy::{is_tradeable, GatingMode, OrderSide, QualityMode, StrategyPolicy};
