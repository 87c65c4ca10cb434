//! Lists Update Store: the transaction-local staging area for inserts,
//! deletes, and in-place updates targeting a relationship table's
//! per-node adjacency/property *lists*.
//!
//! Deletes and updates always check for a matching staged insert first;
//! deleting a staged insert cancels it out (without reclaiming its row
//! in the factorized tuple buffer — the row is simply never read back).
//! Reads merge a persistent range against whatever updates fall inside
//! its offset window. The staging map is keyed
//! `[direction][rel_table][chunk_idx] -> node_offset -> updates`.

use crate::config::StorageConfig;
use crate::ft_buffer::FactorizedTupleBuffer;
use crate::ids::{Direction, NodeId, RelId, TableId};
use crate::property::{PropertyValue, ValueVector};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};

const REL_ID_COL: usize = 0;
const SRC_COL: usize = 1;
const DST_COL: usize = 2;
const FIRST_PROP_COL: usize = 3;

fn dir_idx(direction: Direction) -> usize {
    match direction {
        Direction::Fwd => 0,
        Direction::Bwd => 1,
    }
}

/// Tagged union over the two shapes a list file can take: adjacency
/// lists carry only a direction, property lists also carry which
/// property they hold values for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListFileID {
    AdjList {
        rel_table: TableId,
        direction: Direction,
    },
    RelPropertyList {
        rel_table: TableId,
        direction: Direction,
        property_id: u32,
    },
}

impl ListFileID {
    pub fn rel_table(&self) -> TableId {
        match self {
            ListFileID::AdjList { rel_table, .. } | ListFileID::RelPropertyList { rel_table, .. } => {
                *rel_table
            }
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            ListFileID::AdjList { direction, .. } | ListFileID::RelPropertyList { direction, .. } => {
                *direction
            }
        }
    }
}

/// Per-rel-table declaration of which directions are list-stored (vs.
/// single-column) and how many properties a staged rel carries.
#[derive(Debug, Clone)]
pub struct RelTableSchema {
    pub src_table: TableId,
    pub dst_table: TableId,
    pub stores_as_list: [bool; 2],
    pub num_properties: u32,
}

impl RelTableSchema {
    pub fn new(src_table: TableId, dst_table: TableId, num_properties: u32) -> Self {
        Self {
            src_table,
            dst_table,
            stores_as_list: [true, true],
            num_properties,
        }
    }

    pub fn with_stores_as_list(mut self, fwd: bool, bwd: bool) -> Self {
        self.stores_as_list = [fwd, bwd];
        self
    }

    pub fn bound_table(&self, direction: Direction) -> TableId {
        match direction {
            Direction::Fwd => self.src_table,
            Direction::Bwd => self.dst_table,
        }
    }

    pub fn stores_as_list(&self, direction: Direction) -> bool {
        self.stores_as_list[dir_idx(direction)]
    }
}

#[derive(Debug, Default, Clone)]
pub struct ListsUpdatesForNodeOffset {
    pub is_newly_added_node: bool,
    pub inserted_rels_tuple_idx_in_ft: Vec<usize>,
    pub deleted_rel_ids: HashSet<RelId>,
    /// property_id -> (persistent list_offset -> row idx in `lists_updates[property_id]`)
    pub updated_persistent_list_offsets: HashMap<u32, HashMap<u64, usize>>,
}

impl ListsUpdatesForNodeOffset {
    pub fn is_empty(&self) -> bool {
        !self.is_newly_added_node
            && self.inserted_rels_tuple_idx_in_ft.is_empty()
            && self.deleted_rel_ids.is_empty()
            && self.updated_persistent_list_offsets.is_empty()
    }
}

/// Carries the per-direction list offsets an update targets; the
/// persistent list position differs between the forward and backward
/// adjacency lists of the same rel.
pub struct UpdateInfo {
    pub rel_id: RelId,
    pub rel_table: TableId,
    pub property_id: u32,
    pub new_value: PropertyValue,
    pub list_offset_fwd: u64,
    pub list_offset_bwd: u64,
}

/// The handle a read-time merge needs to locate a staged-insert window:
/// which node, and which slice of its insert list to materialize.
pub struct ListReadHandle {
    pub node_offset: u64,
    pub start_idx_in_inserted: usize,
    pub num_to_read: usize,
}

type ChunkMap = HashMap<u64, HashMap<u64, ListsUpdatesForNodeOffset>>;

pub struct ListsUpdateStore {
    cfg: StorageConfig,
    schemas: HashMap<TableId, RelTableSchema>,
    ft_of_inserted_rels: FactorizedTupleBuffer,
    lists_updates: HashMap<u32, FactorizedTupleBuffer>,
    updates: [HashMap<TableId, ChunkMap>; 2],
}

impl ListsUpdateStore {
    pub fn new(cfg: StorageConfig, schemas: HashMap<TableId, RelTableSchema>) -> Self {
        let max_properties = schemas.values().map(|s| s.num_properties).max().unwrap_or(0);
        let ft_of_inserted_rels = FactorizedTupleBuffer::new(FIRST_PROP_COL + max_properties as usize);
        Self {
            cfg,
            schemas,
            ft_of_inserted_rels,
            lists_updates: HashMap::new(),
            updates: [HashMap::new(), HashMap::new()],
        }
    }

    fn schema(&self, rel_table: TableId) -> Result<RelTableSchema> {
        self.schemas
            .get(&rel_table)
            .cloned()
            .ok_or(Error::Logic("unknown rel table"))
    }

    fn qualifying_directions(schema: &RelTableSchema) -> Vec<Direction> {
        Direction::ALL
            .into_iter()
            .filter(|d| schema.stores_as_list(*d))
            .collect()
    }

    fn bound_offset(direction: Direction, src: NodeId, dst: NodeId) -> u64 {
        match direction {
            Direction::Fwd => src.offset,
            Direction::Bwd => dst.offset,
        }
    }

    fn entry_mut(
        &mut self,
        direction: Direction,
        rel_table: TableId,
        node_offset: u64,
    ) -> &mut ListsUpdatesForNodeOffset {
        let chunk_idx = self.cfg.chunk_idx(node_offset);
        self.updates[dir_idx(direction)]
            .entry(rel_table)
            .or_default()
            .entry(chunk_idx)
            .or_default()
            .entry(node_offset)
            .or_default()
    }

    fn get_mut(
        &mut self,
        direction: Direction,
        rel_table: TableId,
        node_offset: u64,
    ) -> Option<&mut ListsUpdatesForNodeOffset> {
        let chunk_idx = self.cfg.chunk_idx(node_offset);
        self.updates[dir_idx(direction)]
            .get_mut(&rel_table)?
            .get_mut(&chunk_idx)?
            .get_mut(&node_offset)
    }

    pub fn get(
        &self,
        direction: Direction,
        rel_table: TableId,
        node_offset: u64,
    ) -> Option<&ListsUpdatesForNodeOffset> {
        let chunk_idx = self.cfg.chunk_idx(node_offset);
        self.updates[dir_idx(direction)]
            .get(&rel_table)?
            .get(&chunk_idx)?
            .get(&node_offset)
    }

    fn col_idx_in_ft(list_file_id: &ListFileID) -> usize {
        match list_file_id {
            ListFileID::AdjList {
                direction: Direction::Fwd,
                ..
            } => DST_COL,
            ListFileID::AdjList {
                direction: Direction::Bwd,
                ..
            } => SRC_COL,
            ListFileID::RelPropertyList { property_id, .. } => FIRST_PROP_COL + *property_id as usize,
        }
    }

    /// Stages an insert. A direction not stored as a list is silently
    /// skipped for that direction — the column-storage path handles it
    /// elsewhere, outside this store's remit.
    pub fn insert_rel(
        &mut self,
        src: NodeId,
        dst: NodeId,
        rel_id: RelId,
        rel_table: TableId,
        properties: Vec<PropertyValue>,
    ) -> Result<()> {
        let schema = self.schema(rel_table)?;
        let qualifying = Self::qualifying_directions(&schema);
        if qualifying.is_empty() {
            return Ok(());
        }

        let mut row = vec![
            PropertyValue::Int(rel_id),
            PropertyValue::Int(src.offset as i64),
            PropertyValue::Int(dst.offset as i64),
        ];
        row.extend(properties);
        while row.len() < self.ft_of_inserted_rels.num_columns() {
            row.push(PropertyValue::Null);
        }
        let tuple_idx = self.ft_of_inserted_rels.append(row)? - 1;

        for direction in qualifying {
            let bound_offset = Self::bound_offset(direction, src, dst);
            self.entry_mut(direction, rel_table, bound_offset)
                .inserted_rels_tuple_idx_in_ft
                .push(tuple_idx);
        }
        Ok(())
    }

    /// If `rel_id` is a staged insert, the tuple idx is dropped from the
    /// node's insert list without reclaiming its FT row (other staged
    /// structures may still reference that row index). Otherwise the rel
    /// is assumed to exist in the persistent store and is marked deleted.
    pub fn delete_rel(
        &mut self,
        src: NodeId,
        dst: NodeId,
        rel_id: RelId,
        rel_table: TableId,
    ) -> Result<()> {
        let schema = self.schema(rel_table)?;
        let qualifying = Self::qualifying_directions(&schema);
        if qualifying.is_empty() {
            return Ok(());
        }

        let staged_idx = self
            .ft_of_inserted_rels
            .find_value_in_flat_column(REL_ID_COL, &PropertyValue::Int(rel_id));

        if staged_idx >= 0 {
            let tuple_idx = staged_idx as usize;
            for direction in qualifying {
                let bound_offset = Self::bound_offset(direction, src, dst);
                if let Some(entry) = self.get_mut(direction, rel_table, bound_offset) {
                    entry
                        .inserted_rels_tuple_idx_in_ft
                        .retain(|&idx| idx != tuple_idx);
                }
            }
        } else {
            for direction in qualifying {
                let bound_offset = Self::bound_offset(direction, src, dst);
                self.entry_mut(direction, rel_table, bound_offset)
                    .deleted_rel_ids
                    .insert(rel_id);
            }
        }
        Ok(())
    }

    pub fn update_rel(&mut self, src: NodeId, dst: NodeId, info: UpdateInfo) -> Result<()> {
        let staged_idx = self
            .ft_of_inserted_rels
            .find_value_in_flat_column(REL_ID_COL, &PropertyValue::Int(info.rel_id));
        if staged_idx >= 0 {
            let col_idx = FIRST_PROP_COL + info.property_id as usize;
            self.ft_of_inserted_rels
                .update_flat_cell(staged_idx as usize, col_idx, info.new_value)?;
            return Ok(());
        }

        let schema = self.schema(info.rel_table)?;
        let qualifying = Self::qualifying_directions(&schema);
        if qualifying.is_empty() {
            return Ok(());
        }

        let table = self
            .lists_updates
            .entry(info.property_id)
            .or_insert_with(|| FactorizedTupleBuffer::new(1));
        let ft_tuple_idx = table.append(vec![info.new_value])? - 1;

        for direction in qualifying {
            let bound_offset = Self::bound_offset(direction, src, dst);
            let list_offset = match direction {
                Direction::Fwd => info.list_offset_fwd,
                Direction::Bwd => info.list_offset_bwd,
            };
            self.entry_mut(direction, info.rel_table, bound_offset)
                .updated_persistent_list_offsets
                .entry(info.property_id)
                .or_default()
                .insert(list_offset, ft_tuple_idx);
        }
        Ok(())
    }

    pub fn init_newly_added_node(&mut self, node: NodeId) {
        let targets: Vec<(TableId, Direction)> = self
            .schemas
            .iter()
            .flat_map(|(&rel_table, schema)| {
                Direction::ALL.into_iter().filter_map(move |direction| {
                    if schema.stores_as_list(direction) && schema.bound_table(direction) == node.table_id {
                        Some((rel_table, direction))
                    } else {
                        None
                    }
                })
            })
            .collect();

        for (rel_table, direction) in targets {
            self.entry_mut(direction, rel_table, node.offset)
                .is_newly_added_node = true;
        }
    }

    /// Materializes staged-insert rows into `out_vector`, starting at
    /// `handle.start_idx_in_inserted` within the node's insert list.
    pub fn read_values(
        &self,
        list_file_id: &ListFileID,
        handle: &ListReadHandle,
        out_vector: &mut ValueVector,
    ) -> Result<()> {
        let Some(entry) = self.get(list_file_id.direction(), list_file_id.rel_table(), handle.node_offset)
        else {
            return Ok(());
        };
        if entry.inserted_rels_tuple_idx_in_ft.is_empty() {
            return Ok(());
        }
        let col_idx = Self::col_idx_in_ft(list_file_id);
        let rows = self.ft_of_inserted_rels.lookup(
            &[col_idx],
            &entry.inserted_rels_tuple_idx_in_ft,
            handle.start_idx_in_inserted,
            handle.num_to_read,
        )?;
        for i in 0..handle.num_to_read {
            if let Some(value) = rows[0].get(i) {
                out_vector.set(i, value.clone());
            }
        }
        Ok(())
    }

    /// Overwrites every position in `out_vector` whose persistent list
    /// offset (within `[start_list_offset, start_list_offset +
    /// out_vector.original_size()`) has a staged update.
    pub fn read_updates_to_property_vector(
        &self,
        list_file_id: &ListFileID,
        node_offset: u64,
        out_vector: &mut ValueVector,
        start_list_offset: u64,
    ) -> Result<()> {
        let ListFileID::RelPropertyList {
            rel_table,
            direction,
            property_id,
        } = *list_file_id
        else {
            return Err(Error::Logic(
                "read_updates_to_property_vector requires a property list",
            ));
        };

        let Some(entry) = self.get(direction, rel_table, node_offset) else {
            return Ok(());
        };
        let Some(offsets) = entry.updated_persistent_list_offsets.get(&property_id) else {
            return Ok(());
        };
        let Some(table) = self.lists_updates.get(&property_id) else {
            return Ok(());
        };

        let end_list_offset = start_list_offset + out_vector.original_size() as u64;
        for (&list_offset, &ft_tuple_idx) in offsets {
            if list_offset >= start_list_offset && list_offset < end_list_offset {
                if let Some(value) = table.cell(0, ft_tuple_idx) {
                    out_vector.set((list_offset - start_list_offset) as usize, value.clone());
                }
            }
        }
        Ok(())
    }

    /// Reflects only the hierarchical per-node map, not raw FT row
    /// counts: a staged insert's FT row is never reclaimed when the same
    /// rel is deleted within the same transaction, so counting FT rows
    /// would keep reporting updates for a net-zero edit.
    pub fn has_updates(&self) -> bool {
        self.updates.iter().any(|per_rel_table| {
            per_rel_table
                .values()
                .any(|per_chunk| per_chunk.values().any(|entry| !entry.is_empty()))
        })
    }

    pub fn num_inserted_rels_for_node(&self, list_file_id: &ListFileID, node_offset: u64) -> usize {
        self.get(list_file_id.direction(), list_file_id.rel_table(), node_offset)
            .map(|e| e.inserted_rels_tuple_idx_in_ft.len())
            .unwrap_or(0)
    }

    pub fn num_deleted_rels(&self, list_file_id: &ListFileID, node_offset: u64) -> usize {
        self.get(list_file_id.direction(), list_file_id.rel_table(), node_offset)
            .map(|e| e.deleted_rel_ids.len())
            .unwrap_or(0)
    }

    pub fn is_rel_deleted_in_persistent_store(
        &self,
        list_file_id: &ListFileID,
        node_offset: u64,
        rel_id: RelId,
    ) -> bool {
        self.get(list_file_id.direction(), list_file_id.rel_table(), node_offset)
            .map(|e| e.deleted_rel_ids.contains(&rel_id))
            .unwrap_or(false)
    }

    pub fn is_newly_added_node(&self, list_file_id: &ListFileID, node_offset: u64) -> bool {
        self.get(list_file_id.direction(), list_file_id.rel_table(), node_offset)
            .map(|e| e.is_newly_added_node)
            .unwrap_or(false)
    }

    pub fn has_any_deleted_rels_in_persistent_store(
        &self,
        list_file_id: &ListFileID,
        node_offset: u64,
    ) -> bool {
        self.get(list_file_id.direction(), list_file_id.rel_table(), node_offset)
            .map(|e| !e.deleted_rel_ids.is_empty())
            .unwrap_or(false)
    }

    /// Discards all staged state. Used by transaction rollback; never
    /// touches the persistent store.
    pub fn clear(&mut self) {
        self.ft_of_inserted_rels = FactorizedTupleBuffer::new(self.ft_of_inserted_rels.num_columns());
        self.lists_updates.clear();
        self.updates = [HashMap::new(), HashMap::new()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ListsUpdateStore {
        let mut schemas = HashMap::new();
        schemas.insert(
            TableId::new(0),
            RelTableSchema::new(TableId::new(1), TableId::new(1), 2),
        );
        ListsUpdateStore::new(StorageConfig::default(), schemas)
    }

    fn node(offset: u64) -> NodeId {
        NodeId::new(TableId::new(1), offset)
    }

    #[test]
    fn insert_then_delete_within_same_txn_leaves_no_residue() {
        let mut store = store();
        let rel_table = TableId::new(0);
        store
            .insert_rel(node(1), node(2), 100, rel_table, vec![PropertyValue::Int(1), PropertyValue::Null])
            .unwrap();
        assert!(store.has_updates());

        store.delete_rel(node(1), node(2), 100, rel_table).unwrap();

        let fwd = ListFileID::AdjList {
            rel_table,
            direction: Direction::Fwd,
        };
        assert_eq!(store.num_inserted_rels_for_node(&fwd, 1), 0);
        assert!(!store.is_rel_deleted_in_persistent_store(&fwd, 1, 100));
        assert!(!store.has_updates());
    }

    #[test]
    fn delete_of_persistent_rel_adds_to_deletion_set() {
        let mut store = store();
        let rel_table = TableId::new(0);
        store.delete_rel(node(1), node(2), 7, rel_table).unwrap();

        let fwd = ListFileID::AdjList {
            rel_table,
            direction: Direction::Fwd,
        };
        let bwd = ListFileID::AdjList {
            rel_table,
            direction: Direction::Bwd,
        };
        assert!(store.is_rel_deleted_in_persistent_store(&fwd, 1, 7));
        assert!(store.has_any_deleted_rels_in_persistent_store(&bwd, 2));
    }

    #[test]
    fn num_inserted_rels_counts_inserts_since_begin() {
        let mut store = store();
        let rel_table = TableId::new(0);
        for rel_id in 0..3 {
            store
                .insert_rel(node(1), node(2), rel_id, rel_table, vec![PropertyValue::Int(rel_id), PropertyValue::Null])
                .unwrap();
        }
        let fwd = ListFileID::AdjList {
            rel_table,
            direction: Direction::Fwd,
        };
        assert_eq!(store.num_inserted_rels_for_node(&fwd, 1), 3);
    }

    #[test]
    fn update_on_persistent_rel_only_keeps_latest_value() {
        let mut store = store();
        let rel_table = TableId::new(0);

        store
            .update_rel(
                node(1),
                node(2),
                UpdateInfo {
                    rel_id: 50,
                    rel_table,
                    property_id: 0,
                    new_value: PropertyValue::Int(1),
                    list_offset_fwd: 5,
                    list_offset_bwd: 9,
                },
            )
            .unwrap();
        store
            .update_rel(
                node(1),
                node(2),
                UpdateInfo {
                    rel_id: 50,
                    rel_table,
                    property_id: 0,
                    new_value: PropertyValue::Int(2),
                    list_offset_fwd: 5,
                    list_offset_bwd: 9,
                },
            )
            .unwrap();

        let prop_list = ListFileID::RelPropertyList {
            rel_table,
            direction: Direction::Fwd,
            property_id: 0,
        };
        let mut out = ValueVector::with_len(64);
        store
            .read_updates_to_property_vector(&prop_list, 1, &mut out, 0)
            .unwrap();
        assert_eq!(out.get(5), Some(&PropertyValue::Int(2)));
    }

    #[test]
    fn update_overlapping_window_only_touches_offsets_in_range() {
        let mut store = store();
        let rel_table = TableId::new(0);
        for (offset, value) in [(5u64, 50i64), (20, 200), (63, 630)] {
            store
                .update_rel(
                    node(1),
                    node(2),
                    UpdateInfo {
                        rel_id: offset as i64 + 1000,
                        rel_table,
                        property_id: 0,
                        new_value: PropertyValue::Int(value),
                        list_offset_fwd: offset,
                        list_offset_bwd: offset,
                    },
                )
                .unwrap();
        }

        let prop_list = ListFileID::RelPropertyList {
            rel_table,
            direction: Direction::Fwd,
            property_id: 0,
        };
        let mut out = ValueVector::from_values(vec![PropertyValue::Int(-1); 64]);
        store
            .read_updates_to_property_vector(&prop_list, 1, &mut out, 0)
            .unwrap();

        assert_eq!(out.get(5), Some(&PropertyValue::Int(50)));
        assert_eq!(out.get(20), Some(&PropertyValue::Int(200)));
        assert_eq!(out.get(63), Some(&PropertyValue::Int(630)));
        assert_eq!(out.get(0), Some(&PropertyValue::Int(-1)));
    }

    #[test]
    fn update_on_staged_insert_overwrites_ft_row_in_place() {
        let mut store = store();
        let rel_table = TableId::new(0);
        store
            .insert_rel(node(1), node(2), 9, rel_table, vec![PropertyValue::Int(0), PropertyValue::Null])
            .unwrap();
        store
            .update_rel(
                node(1),
                node(2),
                UpdateInfo {
                    rel_id: 9,
                    rel_table,
                    property_id: 0,
                    new_value: PropertyValue::Int(77),
                    list_offset_fwd: 0,
                    list_offset_bwd: 0,
                },
            )
            .unwrap();
        assert_eq!(
            store.ft_of_inserted_rels.cell(FIRST_PROP_COL, 0),
            Some(&PropertyValue::Int(77))
        );
    }

    #[test]
    fn init_newly_added_node_marks_qualifying_directions() {
        let mut store = store();
        store.init_newly_added_node(node(1));
        let fwd = ListFileID::AdjList {
            rel_table: TableId::new(0),
            direction: Direction::Fwd,
        };
        assert!(store.is_newly_added_node(&fwd, 1));
    }

    #[test]
    fn insert_targeting_non_list_direction_is_silently_dropped() {
        let mut schemas = HashMap::new();
        schemas.insert(
            TableId::new(0),
            RelTableSchema::new(TableId::new(1), TableId::new(1), 1).with_stores_as_list(true, false),
        );
        let mut store = ListsUpdateStore::new(StorageConfig::default(), schemas);
        let rel_table = TableId::new(0);
        store
            .insert_rel(node(1), node(2), 1, rel_table, vec![PropertyValue::Null])
            .unwrap();

        let bwd = ListFileID::AdjList {
            rel_table,
            direction: Direction::Bwd,
        };
        assert_eq!(store.num_inserted_rels_for_node(&bwd, 2), 0);
        let fwd = ListFileID::AdjList {
            rel_table,
            direction: Direction::Fwd,
        };
        assert_eq!(store.num_inserted_rels_for_node(&fwd, 1), 1);
    }

    #[test]
    fn clear_discards_all_staged_state() {
        let mut store = store();
        let rel_table = TableId::new(0);
        store
            .insert_rel(node(1), node(2), 1, rel_table, vec![PropertyValue::Null, PropertyValue::Null])
            .unwrap();
        store.clear();
        assert!(!store.has_updates());
    }
}
