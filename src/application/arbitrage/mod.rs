pub mod executor;
pub mod flash_loan;
pub mod monitor;
pub mod triangular;

pub use executor::ArbitrageExecutor;
pub use flash_loan::FlashLoanHandler;
pub use monitor::ArbitrageMonitor;
