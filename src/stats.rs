//! Relationship Statistics Catalog: per-table tuple counts and the
//! monotonically increasing next relationship offset, double-buffered so
//! readers never observe an in-flight writer's changes.
//!
//! A `read_only` snapshot and a `write` snapshot are kept side by side;
//! a commit's checkpoint clones `write` into `read_only`, a rollback
//! clones `read_only` back into `write`. Persisted with a manual
//! fixed-layout encode/decode rather than a serde format.

use crate::ids::{TableId, TxnKind};
use crate::pager::PagedFile;
use crate::property::PropertyValue;
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyStatistics {
    pub min: Option<PropertyValue>,
    pub max: Option<PropertyValue>,
    pub num_nulls: u64,
}

impl PropertyStatistics {
    fn encode(&self, out: &mut Vec<u8>) {
        encode_optional_value(&self.min, out);
        encode_optional_value(&self.max, out);
        out.extend_from_slice(&self.num_nulls.to_le_bytes());
    }

    fn decode(bytes: &[u8], pos: &mut usize) -> Result<Self> {
        let min = decode_optional_value(bytes, pos)?;
        let max = decode_optional_value(bytes, pos)?;
        let num_nulls = read_u64(bytes, pos)?;
        Ok(Self {
            min,
            max,
            num_nulls,
        })
    }
}

fn encode_optional_value(value: &Option<PropertyValue>, out: &mut Vec<u8>) {
    match value {
        None => out.push(0),
        Some(v) => {
            out.push(1);
            let encoded = v.encode();
            out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
            out.extend_from_slice(&encoded);
        }
    }
}

fn decode_optional_value(bytes: &[u8], pos: &mut usize) -> Result<Option<PropertyValue>> {
    let tag = read_u8(bytes, pos)?;
    if tag == 0 {
        return Ok(None);
    }
    let len = read_u32(bytes, pos)? as usize;
    let slice = read_slice(bytes, pos, len)?;
    let value = PropertyValue::decode(slice)
        .map_err(|_| Error::MalformedWalRecord("invalid property statistics value"))?;
    Ok(Some(value))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelTableStats {
    pub num_rels: u64,
    pub next_rel_offset: u64,
    pub per_property_stats: Vec<PropertyStatistics>,
}

impl RelTableStats {
    fn encode(&self, table_id: TableId, out: &mut Vec<u8>) {
        out.extend_from_slice(&table_id.0.to_le_bytes());
        out.extend_from_slice(&self.num_rels.to_le_bytes());
        out.extend_from_slice(&self.next_rel_offset.to_le_bytes());
        out.extend_from_slice(&(self.per_property_stats.len() as u32).to_le_bytes());
        for stat in &self.per_property_stats {
            stat.encode(out);
        }
    }

    fn decode(bytes: &[u8], pos: &mut usize) -> Result<(TableId, Self)> {
        let table_id = TableId::new(read_u64(bytes, pos)?);
        let num_rels = read_u64(bytes, pos)?;
        let next_rel_offset = read_u64(bytes, pos)?;
        let num_properties = read_u32(bytes, pos)? as usize;
        let mut per_property_stats = Vec::with_capacity(num_properties);
        for _ in 0..num_properties {
            per_property_stats.push(PropertyStatistics::decode(bytes, pos)?);
        }
        Ok((
            table_id,
            Self {
                num_rels,
                next_rel_offset,
                per_property_stats,
            },
        ))
    }
}

fn read_u8(bytes: &[u8], pos: &mut usize) -> Result<u8> {
    let slice = read_slice(bytes, pos, 1)?;
    Ok(slice[0])
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let slice = read_slice(bytes, pos, 4)?;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let slice = read_slice(bytes, pos, 8)?;
    Ok(u64::from_le_bytes(slice.try_into().unwrap()))
}

fn read_slice<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    if *pos + len > bytes.len() {
        return Err(Error::MalformedWalRecord("truncated statistics file"));
    }
    let slice = &bytes[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

/// Double-buffered relationship statistics: `read_only` is what concurrent
/// readers see, `write` is exclusive to the active writer transaction and
/// is only published into `read_only` at checkpoint.
#[derive(Debug, Default)]
pub struct RelsStatisticsCatalog {
    read_only: HashMap<TableId, RelTableStats>,
    write: HashMap<TableId, RelTableStats>,
}

impl RelsStatisticsCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = std::fs::read(path)?;
        let map = Self::deserialize(&bytes)?;
        Ok(Self {
            read_only: map.clone(),
            write: map,
        })
    }

    pub fn get_rel_statistics(&self, table_id: TableId) -> Result<&RelTableStats> {
        self.read_only
            .get(&table_id)
            .ok_or(Error::Logic("no statistics for table"))
    }

    pub fn set_num_tuples_for_table(&mut self, table_id: TableId, num_rels: u64) {
        self.write.entry(table_id).or_default().num_rels = num_rels;
    }

    pub fn update_num_rels_by_value(&mut self, table_id: TableId, delta: i64) -> Result<()> {
        let entry = self.write.entry(table_id).or_default();
        let updated = entry.num_rels as i64 + delta;
        if updated < 0 {
            return Err(Error::InvariantViolation(
                "num_rels would underflow below zero",
            ));
        }
        entry.num_rels = updated as u64;
        Ok(())
    }

    pub fn get_next_rel_offset(&self, txn_kind: TxnKind, table_id: TableId) -> Result<u64> {
        let snapshot = match txn_kind {
            TxnKind::ReadOnly => &self.read_only,
            TxnKind::Write => &self.write,
        };
        snapshot
            .get(&table_id)
            .map(|s| s.next_rel_offset)
            .ok_or(Error::Logic("no statistics for table"))
    }

    /// Bumps the write snapshot's next-offset by `n`; the caller owns
    /// assigning the `n` reserved offsets to the rels it is inserting.
    pub fn increase_next_rel_offset(&mut self, table_id: TableId, n: u64) -> Result<()> {
        let entry = self.write.entry(table_id).or_default();
        entry.next_rel_offset = entry
            .next_rel_offset
            .checked_add(n)
            .ok_or(Error::Capacity("next_rel_offset overflow"))?;
        Ok(())
    }

    /// Discards pending writer-snapshot changes, reverting to the last
    /// checkpointed state. Used by transaction rollback.
    pub fn rollback(&mut self) {
        self.write = self.read_only.clone();
    }

    fn serialize(&self) -> Vec<u8> {
        let mut table_ids: Vec<&TableId> = self.write.keys().collect();
        table_ids.sort();
        let mut out = Vec::new();
        out.extend_from_slice(&(table_ids.len() as u32).to_le_bytes());
        for table_id in table_ids {
            self.write[table_id].encode(*table_id, &mut out);
        }
        out
    }

    fn deserialize(bytes: &[u8]) -> Result<HashMap<TableId, RelTableStats>> {
        let mut pos = 0usize;
        let count = read_u32(bytes, &mut pos)? as usize;
        let mut map = HashMap::with_capacity(count);
        for _ in 0..count {
            let (table_id, stats) = RelTableStats::decode(bytes, &mut pos)?;
            map.insert(table_id, stats);
        }
        Ok(map)
    }

    /// Persists the write snapshot to `path` via atomic rename, then
    /// publishes it into the read-only snapshot.
    pub fn checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.serialize();
        PagedFile::atomic_replace(path.as_ref(), &bytes)?;
        self.read_only = self.write.clone();
        Ok(())
    }
}

/// Default on-disk name for the relationship statistics snapshot, per the
/// `rels.statistics` naming in the external-interfaces layout.
pub fn default_stats_path(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join("rels.statistics")
}
