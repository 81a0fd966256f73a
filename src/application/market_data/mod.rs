pub mod feeds;
pub mod flow_service;
pub mod price_cache;
pub mod strategy_requests;

pub use flow_service::FlowDataService;
pub use price_cache::{PriceCache, StalenessThresholds};
pub use strategy_requests::StrategyRequestHandler;
