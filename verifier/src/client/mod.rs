//! Ledger access boundary.
//!
//! The verifier core never talks to a node directly: everything it reads goes
//! through [`LedgerQuery`] and everything it mutates goes through
//! [`LedgerMutation`]. Production wires these to the RPC client; tests wire
//! them to [`memory::MemoryLedger`]. Values cross the boundary in raw wire
//! shape ([`RawValue`]) and are decoded by the caller through the fixed-point
//! codec, so decode failures stay attributable to the field that produced
//! them.

pub mod memory;

use async_trait::async_trait;

/// The wire-format fixed-point unit for delegation proportions: a u64 where
/// `u64::MAX` means "everything".
pub const PROPORTION_SCALE: u64 = u64::MAX;
use plexus_common::fixed_point::{self, DecodeError, FixedPointFormat};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 32-byte account identifier. Coldkeys and hotkeys share this shape.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountId([u8; 32]);

impl AccountId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Convenience for tests and fixtures: id derived from a single byte.
    pub fn from_byte(tag: u8) -> Self {
        let mut bytes = [0u8; 32];
        bytes[0] = tag;
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // shortened form for logs, full form is Display
        write!(f, "{}..", hex::encode(&self.0[..4]))
    }
}

impl FromStr for AccountId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|_| DecodeError::Malformed(s.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| DecodeError::Malformed(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for AccountId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for AccountId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Closed set of storage maps the rule catalog and the contracts touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MapId {
    /// netuid -> registered uid count
    SubnetworkN,
    /// netuid -> configured uid ceiling
    MaxAllowedUids,
    /// (netuid, hotkey) -> uid
    Uids,
    /// (netuid, uid) -> hotkey
    Keys,
    /// (hotkey, coldkey, netuid) -> stake shares, U64F64
    Alpha,
    /// (hotkey, netuid) -> share total, U64F64
    TotalHotkeyShares,
    /// (hotkey, netuid) -> staked alpha
    TotalHotkeyAlpha,
    /// netuid -> alpha staked out of the pool
    SubnetAlphaOut,
    /// netuid -> emission not yet distributed
    PendingEmission,
    /// (parent, netuid) -> [(proportion, child)]
    ChildKeys,
    /// (child, netuid) -> [(proportion, parent)]
    ParentKeys,
    /// (netuid, parent) -> {children: [(proportion, child)], cooldown}
    PendingChildKeys,
    /// (netuid, index) -> {liquidity, tick_low, tick_high}
    Positions,
    /// netuid -> current sqrt price, U64F64
    AlphaSqrtPrice,
    /// netuid -> tao reserve
    SubnetTao,
    /// netuid -> alpha reserve
    SubnetAlphaIn,
    /// netuid -> membership marker
    ActiveSubnets,
}

impl MapId {
    /// Wire format of the map's numeric values. `None` for list- and
    /// object-valued maps, which carry no single fixed-point field.
    pub fn value_format(&self) -> Option<FixedPointFormat> {
        match self {
            MapId::Alpha | MapId::TotalHotkeyShares | MapId::AlphaSqrtPrice => {
                Some(fixed_point::U64F64)
            }
            MapId::Keys
            | MapId::ChildKeys
            | MapId::ParentKeys
            | MapId::PendingChildKeys
            | MapId::Positions
            | MapId::ActiveSubnets => None,
            _ => Some(fixed_point::U64F0),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MapId::SubnetworkN => "SubnetworkN",
            MapId::MaxAllowedUids => "MaxAllowedUids",
            MapId::Uids => "Uids",
            MapId::Keys => "Keys",
            MapId::Alpha => "Alpha",
            MapId::TotalHotkeyShares => "TotalHotkeyShares",
            MapId::TotalHotkeyAlpha => "TotalHotkeyAlpha",
            MapId::SubnetAlphaOut => "SubnetAlphaOut",
            MapId::PendingEmission => "PendingEmission",
            MapId::ChildKeys => "ChildKeys",
            MapId::ParentKeys => "ParentKeys",
            MapId::PendingChildKeys => "PendingChildKeys",
            MapId::Positions => "Positions",
            MapId::AlphaSqrtPrice => "AlphaSqrtPrice",
            MapId::SubnetTao => "SubnetTao",
            MapId::SubnetAlphaIn => "SubnetAlphaIn",
            MapId::ActiveSubnets => "ActiveSubnets",
        }
    }
}

/// One component of a storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScalarKey {
    Subnet(u16),
    Account(AccountId),
    Index(u64),
}

impl fmt::Display for ScalarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarKey::Subnet(netuid) => write!(f, "netuid={}", netuid),
            ScalarKey::Account(account) => write!(f, "account={:?}", account),
            ScalarKey::Index(idx) => write!(f, "index={}", idx),
        }
    }
}

/// Single, double or triple key, in map declaration order.
pub type KeyTuple = Vec<ScalarKey>;

pub fn format_keys(keys: &[ScalarKey]) -> String {
    keys.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A raw wire value: JSON number, numeric string (decimal or 0x-hex), array
/// or object, exactly as the node returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawValue(pub serde_json::Value);

impl RawValue {
    pub fn from_u64(value: u64) -> Self {
        Self(serde_json::json!(value))
    }

    pub fn from_bits(bits: U256) -> Self {
        Self(serde_json::json!(bits.to_string()))
    }

    /// Interpret as a fixed-point bit pattern.
    pub fn bits(&self) -> Result<U256, DecodeError> {
        match &self.0 {
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(U256::from)
                .ok_or(DecodeError::Shape { expected: "unsigned integer" }),
            serde_json::Value::String(s) => fixed_point::parse_bits(s),
            _ => Err(DecodeError::Shape { expected: "number or numeric string" }),
        }
    }

    /// Interpret as a plain unsigned counter.
    pub fn uint(&self) -> Result<u128, DecodeError> {
        let bits = self.bits()?;
        if bits > U256::from(u128::MAX) {
            return Err(DecodeError::Overflow { width: 128 });
        }
        Ok(bits.as_u128())
    }

    /// Interpret as a signed integer (tick indices).
    pub fn int(&self) -> Result<i64, DecodeError> {
        self.0
            .as_i64()
            .ok_or(DecodeError::Shape { expected: "signed integer" })
    }

    /// Interpret as an account identifier.
    pub fn account(&self) -> Result<AccountId, DecodeError> {
        self.0
            .as_str()
            .ok_or(DecodeError::Shape { expected: "hex account string" })?
            .parse()
    }

    /// Interpret as a list of (proportion, account) pairs.
    pub fn pairs(&self) -> Result<Vec<(u64, AccountId)>, DecodeError> {
        let entries = self
            .0
            .as_array()
            .ok_or(DecodeError::Shape { expected: "array of [proportion, account]" })?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let pair = entry
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or(DecodeError::Shape { expected: "[proportion, account] pair" })?;
            let proportion = pair[0]
                .as_u64()
                .ok_or(DecodeError::Shape { expected: "u64 proportion" })?;
            let account: AccountId = pair[1]
                .as_str()
                .ok_or(DecodeError::Shape { expected: "hex account string" })?
                .parse()?;
            out.push((proportion, account));
        }
        Ok(out)
    }
}

/// Opaque resumable scan position. Process-local only: cursors are not
/// meaningful across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(pub u64);

/// One page of scan results.
#[derive(Debug, Clone)]
pub struct Page {
    pub entries: Vec<(KeyTuple, RawValue)>,
    pub next: Option<Cursor>,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("page fetch failed for {map}: {reason}")]
    PageFetch { map: &'static str, reason: String },

    #[error("field read failed for {map}: {reason}")]
    FieldRead { map: &'static str, reason: String },
}

/// Read-only ledger access. Not-found is `Ok(None)`, distinct from any
/// legitimate stored value (including zero).
#[async_trait]
pub trait LedgerQuery: Send + Sync {
    async fn read_field(&self, map: MapId, key: &[ScalarKey]) -> Result<Option<RawValue>, QueryError>;

    async fn scan_page(
        &self,
        map: MapId,
        prefix: &[ScalarKey],
        cursor: Option<Cursor>,
        page_size: usize,
    ) -> Result<Page, QueryError>;
}

/// The mutations the contract catalog drives.
#[derive(Debug, Clone, Serialize)]
pub enum Operation {
    AddStake {
        hotkey: AccountId,
        netuid: u16,
        amount: u64,
    },
    RemoveStake {
        hotkey: AccountId,
        netuid: u16,
        amount: u64,
    },
    SetChildren {
        hotkey: AccountId,
        netuid: u16,
        children: Vec<(u64, AccountId)>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::AddStake { .. } => "add_stake",
            Operation::RemoveStake { .. } => "remove_stake",
            Operation::SetChildren { .. } => "set_children",
        }
    }
}

/// Finalized mutation confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub block: u64,
    /// Confirmed mutation amount, where the operation has one.
    pub amount: Option<u64>,
}

#[derive(Debug, Error)]
pub enum MutationError {
    /// Structured rejection from the node, surfaced verbatim in contract
    /// failure messages.
    #[error("rejected by {module} (code {code}): {reason}")]
    Rejected {
        module: String,
        code: u32,
        reason: String,
    },

    #[error("submission failed: {0}")]
    Transport(String),
}

/// Write access to the ledger. `submit` blocks until the mutation is
/// finalized or rejected.
#[async_trait]
pub trait LedgerMutation: Send + Sync {
    async fn submit(&self, op: Operation, signer: &AccountId) -> Result<SubmitReceipt, MutationError>;
}
