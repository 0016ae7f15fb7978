//! Fountain disperser - fans one multi-chain deposit out into per-chain
//! native gas transfers and tracks every leg to a terminal status.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod intent;
pub mod metrics;
pub mod state;
pub mod tx;
