//! Point-in-time storage snapshots.
//!
//! A snapshot is an immutable view of selected fields, addressed by
//! (map, key tuple). Contract preconditions capture one before the action and
//! postconditions capture a second, independently fetched one afterwards;
//! deltas always come from comparing two snapshots, never from mutating one
//! in place.

use crate::client::{format_keys, KeyTuple, LedgerQuery, MapId, QueryError, RawValue, ScalarKey};
use plexus_common::fixed_point::{decode_exact, DecodeError};
use plexus_common::NumericValue;
use serde::ser::SerializeSeq;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    entries: BTreeMap<(MapId, KeyTuple), RawValue>,
}

// Serialized as a sequence of {map, key, value} records; tuple map keys do
// not survive JSON.
impl Serialize for StorageSnapshot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Entry<'a> {
            map: &'static str,
            key: &'a KeyTuple,
            value: &'a RawValue,
        }
        let mut seq = serializer.serialize_seq(Some(self.entries.len()))?;
        for ((map, key), value) in &self.entries {
            seq.serialize_element(&Entry {
                map: map.name(),
                key,
                value,
            })?;
        }
        seq.end()
    }
}

impl StorageSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every listed field once. Missing fields are simply absent from
    /// the snapshot; readers decide whether absence means zero.
    pub async fn capture(
        ledger: &dyn LedgerQuery,
        fields: &[(MapId, KeyTuple)],
    ) -> Result<Self, QueryError> {
        let mut snapshot = Self::new();
        for (map, key) in fields {
            if let Some(value) = ledger.read_field(*map, key).await? {
                snapshot.insert(*map, key.clone(), value);
            }
        }
        Ok(snapshot)
    }

    pub fn insert(&mut self, map: MapId, key: KeyTuple, value: RawValue) {
        self.entries.insert((map, key), value);
    }

    pub fn get(&self, map: MapId, key: &[ScalarKey]) -> Option<&RawValue> {
        self.entries.get(&(map, key.to_vec()))
    }

    /// Unsigned read treating a missing field as zero.
    pub fn uint_or_zero(&self, map: MapId, key: &[ScalarKey]) -> Result<u128, DecodeError> {
        self.get(map, key).map(|v| v.uint()).unwrap_or(Ok(0))
    }

    /// Fixed-point bits treating a missing field as zero.
    pub fn bits_or_zero(&self, map: MapId, key: &[ScalarKey]) -> Result<primitive_types::U256, DecodeError> {
        self.get(map, key)
            .map(|v| v.bits())
            .unwrap_or(Ok(primitive_types::U256::zero()))
    }

    /// Decode a field into a dynamically typed numeric value according to the
    /// map's declared wire format: plain counters come back as `Uint`,
    /// fixed-point fields as exact `Fixed` decimals. Missing fields read as
    /// zero in the map's own format, so two snapshots of the same field
    /// always compare without a type mismatch.
    pub fn numeric_or_zero(&self, map: MapId, key: &[ScalarKey]) -> Result<NumericValue, DecodeError> {
        let format = map
            .value_format()
            .ok_or(DecodeError::Shape { expected: "numeric-valued map" })?;
        let bits = self.bits_or_zero(map, key)?;
        if format.frac_bits == 0 {
            let value = decode_exact(bits, format)?;
            Ok(NumericValue::Uint(value.bits().as_u128()))
        } else {
            Ok(NumericValue::Fixed(decode_exact(bits, format)?))
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(MapId, KeyTuple), &RawValue)> {
        self.entries.iter()
    }

    /// One-line rendering for diagnostics.
    pub fn describe(&self) -> String {
        self.entries
            .iter()
            .map(|((map, key), value)| format!("{}[{}]={}", map.name(), format_keys(key), value.0))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryLedger;
    use crate::client::AccountId;

    #[tokio::test]
    async fn capture_skips_missing_fields() {
        let ledger = MemoryLedger::new();
        ledger.add_subnet(3, 64);
        let hotkey = AccountId::from_byte(1);

        let snapshot = StorageSnapshot::capture(
            &ledger,
            &[
                (MapId::SubnetAlphaOut, vec![ScalarKey::Subnet(3)]),
                (
                    MapId::TotalHotkeyAlpha,
                    vec![ScalarKey::Account(hotkey), ScalarKey::Subnet(3)],
                ),
            ],
        )
        .await
        .unwrap();

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(MapId::SubnetAlphaOut, &[ScalarKey::Subnet(3)]).is_some());
        assert_eq!(
            snapshot
                .uint_or_zero(
                    MapId::TotalHotkeyAlpha,
                    &[ScalarKey::Account(hotkey), ScalarKey::Subnet(3)]
                )
                .unwrap(),
            0
        );
    }
}
