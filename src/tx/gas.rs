//! Fee escalation policies for dispersal transactions

use crate::chain::GasPrice;

use ethers::types::U256;
use tracing::debug;

/// Turns a network fee estimate into the fees a dispersal is sent with
pub trait FeePolicy: Send + Sync {
    fn apply(&self, estimate: GasPrice) -> GasPrice;

    /// Fixed gas ceiling for a drip call
    fn gas_limit(&self) -> U256;
}

/// Bumps every fee component by a fixed percentage
pub struct PercentageBump {
    /// e.g. 25 = +25%
    bump_percent: u64,
    gas_limit: U256,
}

impl PercentageBump {
    pub fn new(bump_percent: u64, gas_limit: u64) -> Self {
        Self {
            bump_percent,
            gas_limit: U256::from(gas_limit),
        }
    }

    fn bump(&self, value: U256) -> U256 {
        value * (100 + self.bump_percent) / 100
    }
}

impl Default for PercentageBump {
    fn default() -> Self {
        Self::new(25, 750_000)
    }
}

impl FeePolicy for PercentageBump {
    fn apply(&self, estimate: GasPrice) -> GasPrice {
        let bumped = match estimate {
            GasPrice::Legacy(price) => GasPrice::Legacy(self.bump(price)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let max_fee = self.bump(max_fee_per_gas);
                // Priority fee may never exceed the max fee
                let priority = std::cmp::min(self.bump(max_priority_fee_per_gas), max_fee);
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority,
                }
            }
        };

        debug!("Bumped fees by {}%: {:?}", self.bump_percent, bumped);
        bumped
    }

    fn gas_limit(&self) -> U256 {
        self.gas_limit
    }
}
