pub mod core;
pub mod mock;
pub mod observability;
pub mod paper;
pub mod persistence;

pub use mock::{InMemoryOrderStore, InMemoryPositionStore, InMemoryTradeHistory};
