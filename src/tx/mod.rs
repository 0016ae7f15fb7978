//! Dispersal transaction submission with nonce management and fee escalation

mod gas;
mod nonce;
mod sender;

pub use gas::{FeePolicy, PercentageBump};
pub use nonce::NonceManager;
pub use sender::DripSender;
