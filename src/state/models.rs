//! Watch session and transfer record types

use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a watch session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "stopped" => Some(SessionStatus::Stopped),
            _ => None,
        }
    }
}

/// How much of the balance a sweep forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transferMode", rename_all = "snake_case")]
pub enum TransferMode {
    /// Leave `minimum` behind on every forward
    MinimumBalance {
        #[serde(rename = "minimumBalance", with = "u256_decimal")]
        minimum: U256,
    },
    /// Forward the entire balance
    ZeroOut,
}

impl TransferMode {
    pub fn name(&self) -> &'static str {
        match self {
            TransferMode::MinimumBalance { .. } => "minimum_balance",
            TransferMode::ZeroOut => "zero_out",
        }
    }

    pub fn minimum(&self) -> Option<U256> {
        match self {
            TransferMode::MinimumBalance { minimum } => Some(*minimum),
            TransferMode::ZeroOut => None,
        }
    }

    /// Rebuild from the persisted (name, minimum) pair
    pub fn from_parts(name: &str, minimum: Option<&str>) -> Option<Self> {
        match name {
            "zero_out" => Some(TransferMode::ZeroOut),
            "minimum_balance" => {
                let minimum = U256::from_dec_str(minimum?).ok()?;
                Some(TransferMode::MinimumBalance { minimum })
            }
            _ => None,
        }
    }

    /// Amount to forward given the current balance, if any
    pub fn sweep_amount(&self, balance: U256) -> Option<U256> {
        let to_send = match self {
            TransferMode::MinimumBalance { minimum } => balance.checked_sub(*minimum)?,
            TransferMode::ZeroOut => balance,
        };

        if to_send.is_zero() {
            None
        } else {
            Some(to_send)
        }
    }
}

/// A standing instruction to watch one wallet and forward surplus to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSession {
    pub id: Uuid,
    pub watched_address: Address,
    pub destination_address: Address,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub transfer_mode: TransferMode,
    /// Empty means native asset only
    pub tracked_tokens: Vec<Address>,
    pub gas_sponsored: bool,
    pub warpcast_fid: Option<u64>,
}

impl WatchSession {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Assets evaluated on every poll; `None` is the native asset
    pub fn swept_assets(&self) -> Vec<Option<Address>> {
        if self.tracked_tokens.is_empty() {
            vec![None]
        } else {
            self.tracked_tokens.iter().copied().map(Some).collect()
        }
    }
}

/// Input for creating a session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub watched_address: Address,
    pub destination_address: Address,
    pub transfer_mode: TransferMode,
    pub tracked_tokens: Vec<Address>,
    pub gas_sponsored: bool,
    pub warpcast_fid: Option<u64>,
}

impl NewSession {
    pub fn into_session(mut self) -> WatchSession {
        self.tracked_tokens.sort();
        self.tracked_tokens.dedup();

        WatchSession {
            id: Uuid::new_v4(),
            watched_address: self.watched_address,
            destination_address: self.destination_address,
            status: SessionStatus::Active,
            started_at: Utc::now(),
            stopped_at: None,
            transfer_mode: self.transfer_mode,
            tracked_tokens: self.tracked_tokens,
            gas_sponsored: self.gas_sponsored,
            warpcast_fid: self.warpcast_fid,
        }
    }
}

/// Kind of a transfer log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    #[serde(rename = "transfer")]
    Transfer,
    #[serde(rename = "paymaster-transfer")]
    PaymasterTransfer,
    #[serde(rename = "log")]
    Log,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Transfer => "transfer",
            RecordKind::PaymasterTransfer => "paymaster-transfer",
            RecordKind::Log => "log",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transfer" => Some(RecordKind::Transfer),
            "paymaster-transfer" => Some(RecordKind::PaymasterTransfer),
            "log" => Some(RecordKind::Log),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted transfer or activity log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: Uuid,
    pub session_id: Option<Uuid>,
    pub from_address: Option<Address>,
    pub to_address: Option<Address>,
    pub token_address: Option<Address>,
    #[serde(with = "opt_u256_decimal")]
    pub amount: Option<U256>,
    pub tx_hash: Option<String>,
    pub kind: RecordKind,
    pub message: Option<String>,
    /// Provider-side identity of an observed transfer, used for dedup
    pub source_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn references(&self, wallet: &Address) -> bool {
        self.from_address.as_ref() == Some(wallet) || self.to_address.as_ref() == Some(wallet)
    }
}

/// Input for appending a transfer record
#[derive(Debug, Clone, Default)]
pub struct NewTransferRecord {
    pub session_id: Option<Uuid>,
    pub from_address: Option<Address>,
    pub to_address: Option<Address>,
    pub token_address: Option<Address>,
    pub amount: Option<U256>,
    pub tx_hash: Option<String>,
    pub kind: Option<RecordKind>,
    pub message: Option<String>,
    pub source_id: Option<String>,
}

impl NewTransferRecord {
    pub fn into_record(self) -> TransferRecord {
        TransferRecord {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            from_address: self.from_address,
            to_address: self.to_address,
            token_address: self.token_address,
            amount: self.amount,
            tx_hash: self.tx_hash,
            kind: self.kind.unwrap_or(RecordKind::Transfer),
            message: self.message,
            source_id: self.source_id,
            created_at: Utc::now(),
        }
    }
}

/// Filter for listing transfers, most recent first
#[derive(Debug, Clone, Copy)]
pub struct TransferFilter {
    pub session_id: Option<Uuid>,
    pub limit: usize,
}

/// Everything stored about one wallet
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSnapshot {
    pub wallet: Address,
    pub exported_at: DateTime<Utc>,
    pub sessions: Vec<WatchSession>,
    pub transactions: Vec<TransferRecord>,
}

impl WalletSnapshot {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.transactions.is_empty()
    }
}

/// What an erase removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErasedWallet {
    /// Every session row deleted, active or not
    pub session_ids: Vec<Uuid>,
    pub transfers: u64,
}

impl ErasedWallet {
    pub fn sessions(&self) -> usize {
        self.session_ids.len()
    }
}

mod u256_decimal {
    use ethers::types::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(d)?;
        U256::from_dec_str(&raw).map_err(D::Error::custom)
    }
}

mod opt_u256_decimal {
    use ethers::types::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<U256>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => s.serialize_some(&v.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<U256>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|raw| U256::from_dec_str(&raw).map_err(D::Error::custom))
            .transpose()
    }
}
