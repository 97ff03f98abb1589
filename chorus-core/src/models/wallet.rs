use serde::{Deserialize, Serialize};

pub const WALLET_PARTITION: &str = "wallet";

/// Wallet address an agent holds on behalf of a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentWallet {
    #[serde(rename = "PK")]
    pub pk: String,
    #[serde(rename = "SK")]
    pub sk: String,
    #[serde(rename = "walletAddress")]
    pub wallet_address: String,
}

impl AgentWallet {
    pub fn new(user_id: &str, agent: &str, wallet_address: &str) -> Self {
        Self {
            pk: WALLET_PARTITION.to_string(),
            sk: sort_key(user_id, agent),
            wallet_address: wallet_address.to_string(),
        }
    }
}

pub fn sort_key(user_id: &str, agent: &str) -> String {
    format!("{}#{}", user_id, agent)
}
