// Core trading services
pub mod circuit_breaker;
pub mod executor;
pub mod position_engine;
pub mod reconciler;
pub mod risk_gate;
pub mod scheduler;
pub mod stop_loss;
pub mod trading_engine;
