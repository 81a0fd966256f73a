pub mod advanced_controller;
pub mod correlation;
pub mod data;
pub mod portfolio_risk;
pub mod position_sizing;
pub mod rpc;
pub mod stop_loss_manager;

pub use advanced_controller::AdvancedRiskController;
pub use correlation::CorrelationTracker;
pub use data::RiskData;
pub use portfolio_risk::PortfolioRiskController;
pub use position_sizing::PositionSizingEngine;
pub use rpc::RiskCheckService;
pub use stop_loss_manager::StopLossManager;
