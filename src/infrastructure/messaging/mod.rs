pub mod contracts;
pub mod fabric;
pub mod topics;

pub use fabric::{
    ExchangeType, FabricConfig, HandlerOutcome, Message, MessageFabric, MessageHandler,
    declare_core_topology,
};
