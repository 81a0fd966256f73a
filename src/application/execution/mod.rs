pub mod gateway;

pub use gateway::{ApprovedSignal, OrderGateway};
