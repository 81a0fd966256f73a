pub mod activation;
pub mod backtest;
pub mod generation;
pub mod review;
pub mod templates;

pub use activation::ActivationManager;
pub use backtest::{BacktestOrchestrator, CrossoverBacktestEngine};
pub use generation::GenerationManager;
pub use review::DailyReviewer;
