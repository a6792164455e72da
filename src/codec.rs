//! Serialization of tables for data files and worker hand-off.
//!
//! Encoding is deterministic: the same table always encodes to the
//! same bytes, so the digest of the encoding identifies content.

use crate::errors::StoreError;
use crate::table::Table;

/// Content digest of an encoded table.
pub(crate) fn digest(bytes: &[u8]) -> String {
    format!("{:016x}", seahash::hash(bytes))
}

pub(crate) fn encode(name: &str, table: &Table) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(table).map_err(|source| StoreError::Codec {
        what: format!("dataset {name:?}"),
        source,
    })
}

pub(crate) fn decode(name: &str, bytes: &[u8]) -> Result<Table, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Codec {
        what: format!("dataset {name:?}"),
        source,
    })
}

/// `f64`s as their IEEE-754 bit patterns.
///
/// JSON can't carry NaN or infinities and decimal round trips can
/// drift in the last bit.
pub(crate) mod float_bits {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub(crate) fn serialize<S: Serializer>(values: &[f64], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(values.iter().map(|v| v.to_bits()))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        let bits = Vec::<u64>::deserialize(d)?;
        Ok(bits.into_iter().map(f64::from_bits).collect())
    }
}
