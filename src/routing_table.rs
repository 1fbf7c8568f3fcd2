//! Prefix routing table.
//!
//! The table has `160 / b` rows and `2^b` columns. A handle whose identifier
//! first differs from the local identifier at digit `r` lives in row `r`, in
//! the column given by its own digit `r`. The column matching the local digit
//! of each row is always empty: those identifiers belong to a lower row.
//!
//! Row `rows - 1` holds the long hops (no shared prefix); row 0 the shortest.

use std::fmt;

use tracing::trace;

use crate::error::{DecodeError, EncodeError};
use crate::handle::{Liveness, NodeHandle};
use crate::id::{Id, ID_BITS};
use crate::wire::{Decode, Encode, Reader, Writer};

// ─────────────────────────────────────────────────────────────────────────────
// Route Sets
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded set of candidates for one routing-table cell.
///
/// Candidates are kept in ascending proximity order so the first handle that
/// meets a liveness floor is also the nearest one.
#[derive(Clone, Debug)]
pub struct RouteSet {
    handles: Vec<NodeHandle>,
    max: usize,
}

impl RouteSet {
    /// Create an empty set holding at most `max` handles.
    pub fn new(max: usize) -> Self {
        Self {
            handles: Vec::with_capacity(max),
            max: max.max(1),
        }
    }

    /// Insert `handle`, returning true if the set changed.
    ///
    /// A full set first evicts a dead member; failing that, the farthest
    /// member is replaced when `handle` is nearer.
    pub fn put(&mut self, handle: NodeHandle) -> bool {
        if self.handles.iter().any(|h| h.id() == handle.id()) {
            return false;
        }
        if self.handles.len() >= self.max {
            if let Some(dead) = self.handles.iter().position(|h| !h.is_alive()) {
                self.handles.remove(dead);
            } else {
                let farthest = match self.handles.last() {
                    Some(h) => h.proximity_or_max(),
                    None => return false,
                };
                if handle.proximity_or_max() >= farthest {
                    return false;
                }
                self.handles.pop();
            }
        }
        let prox = handle.proximity_or_max();
        let at = self
            .handles
            .iter()
            .position(|h| h.proximity_or_max() > prox)
            .unwrap_or(self.handles.len());
        self.handles.insert(at, handle);
        true
    }

    /// Remove the handle with identifier `id`.
    pub fn remove(&mut self, id: &Id) -> Option<NodeHandle> {
        let pos = self.handles.iter().position(|h| &h.id() == id)?;
        Some(self.handles.remove(pos))
    }

    /// Nearest handle whose liveness is at most `floor`.
    pub fn closest_node(&self, floor: Liveness) -> Option<NodeHandle> {
        self.handles
            .iter()
            .find(|h| h.liveness() <= floor)
            .cloned()
    }

    /// Drop every dead member, returning how many were removed.
    pub fn cull_dead(&mut self) -> usize {
        let before = self.handles.len();
        self.handles.retain(NodeHandle::is_alive);
        before - self.handles.len()
    }

    /// Re-sort after proximity measurements changed.
    pub fn resort(&mut self) {
        self.handles.sort_by_key(NodeHandle::proximity_or_max);
    }

    pub fn get(&self, index: usize) -> Option<&NodeHandle> {
        self.handles.get(index)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.handles.iter().any(|h| &h.id() == id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeHandle> {
        self.handles.iter()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Route Rows
// ─────────────────────────────────────────────────────────────────────────────

/// A copy of one routing-table row, as exchanged during join and hole repair.
#[derive(Clone, Debug, Default)]
pub struct RouteRow {
    index: usize,
    cells: Vec<Vec<NodeHandle>>,
}

impl RouteRow {
    /// Build a row from its cells.
    pub fn new(index: usize, cells: Vec<Vec<NodeHandle>>) -> Self {
        Self { index, cells }
    }

    /// Which table row this is.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The cells, one per column.
    pub fn cells(&self) -> &[Vec<NodeHandle>] {
        &self.cells
    }

    /// Every handle in the row.
    pub fn handles(&self) -> impl Iterator<Item = &NodeHandle> {
        self.cells.iter().flatten()
    }

    /// Mutable access to every handle, for coalescing after decode.
    pub fn handles_mut(&mut self) -> impl Iterator<Item = &mut NodeHandle> {
        self.cells.iter_mut().flatten()
    }

    /// Returns true if no cell holds a handle.
    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(Vec::is_empty)
    }
}

impl Encode for RouteRow {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_u8(self.index as u8);
        writer.write_u16(self.cells.len() as u16);
        for cell in &self.cells {
            writer.write_handles(cell)?;
        }
        Ok(())
    }
}

impl Decode for RouteRow {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let index = reader.read_u8()? as usize;
        if index >= ID_BITS {
            return Err(DecodeError::InvalidValue("route row index"));
        }
        let columns = reader.read_u16()? as usize;
        if columns > 256 {
            return Err(DecodeError::InvalidValue("route row width"));
        }
        let mut cells = Vec::with_capacity(columns);
        for _ in 0..columns {
            cells.push(reader.read_handles()?);
        }
        Ok(Self { index, cells })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Table
// ─────────────────────────────────────────────────────────────────────────────

/// Digit-indexed table of long-distance next hops.
pub struct RoutingTable {
    local: NodeHandle,
    base_bits: usize,
    route_set_max: usize,
    rows: Vec<Vec<Option<RouteSet>>>,
}

impl RoutingTable {
    /// Create an empty table for `local` with `base_bits`-bit digits.
    pub fn new(local: NodeHandle, base_bits: usize, route_set_max: usize) -> Self {
        let num_rows = ID_BITS / base_bits;
        let num_columns = 1usize << base_bits;
        let rows = (0..num_rows).map(|_| vec![None; num_columns]).collect();
        Self {
            local,
            base_bits,
            route_set_max,
            rows,
        }
    }

    /// The local node's handle.
    pub fn local(&self) -> &NodeHandle {
        &self.local
    }

    pub fn base_bits(&self) -> usize {
        self.base_bits
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        1 << self.base_bits
    }

    /// Insert `handle` at the row of its most significant differing digit.
    ///
    /// Returns true if the table changed. The local node is never stored.
    pub fn put(&mut self, handle: NodeHandle) -> bool {
        let local_id = self.local.id();
        let Some(row) = local_id.index_of_msdd(&handle.id(), self.base_bits) else {
            return false;
        };
        let column = handle.id().digit(row, self.base_bits);
        let max = self.route_set_max;
        let id = handle.id();
        let changed = self.rows[row][column]
            .get_or_insert_with(|| RouteSet::new(max))
            .put(handle);
        if changed {
            trace!(peer = %id, row, column, "routing table insert");
        }
        changed
    }

    /// The cell at `[row][column]`, if populated.
    pub fn get(&self, row: usize, column: usize) -> Option<&RouteSet> {
        self.rows
            .get(row)?
            .get(column)?
            .as_ref()
            .filter(|set| !set.is_empty())
    }

    /// The cell that shares one more digit with `target` than the local node.
    pub fn get_best_entry(&self, target: &Id) -> Option<&RouteSet> {
        let row = self.local.id().index_of_msdd(target, self.base_bits)?;
        self.get(row, target.digit(row, self.base_bits))
    }

    /// Mutable variant of [`get_best_entry`](Self::get_best_entry).
    pub fn get_best_entry_mut(&mut self, target: &Id) -> Option<&mut RouteSet> {
        let row = self.local.id().index_of_msdd(target, self.base_bits)?;
        let column = target.digit(row, self.base_bits);
        self.rows[row][column].as_mut()
    }

    /// Closest candidate to `target` in the target's row that is strictly
    /// closer than the local node, searching the columns on both sides of the
    /// target's digit until the local digit is reached.
    pub fn best_alternate_route(&self, floor: Liveness, target: &Id) -> Option<NodeHandle> {
        let local_id = self.local.id();
        let row = local_id.index_of_msdd(target, self.base_bits)?;
        let columns = self.num_columns();
        let mask = columns - 1;
        let target_digit = target.digit(row, self.base_bits);
        let local_digit = local_id.digit(row, self.base_bits);

        let mut best_distance = local_id.distance(target);
        let mut best = None;
        for step in 1..=columns {
            let mut reached_local = false;
            for digit in [
                (target_digit + step) & mask,
                (target_digit + columns - step) & mask,
            ] {
                if let Some(set) = self.rows[row][digit].as_ref() {
                    for handle in set.iter().filter(|h| h.liveness() <= floor) {
                        let distance = handle.id().distance(target);
                        if distance < best_distance {
                            best_distance = distance;
                            best = Some(handle.clone());
                        }
                    }
                }
                reached_local |= digit == local_digit;
            }
            if reached_local {
                break;
            }
        }
        best
    }

    /// Copy of row `index`.
    pub fn get_row(&self, index: usize) -> RouteRow {
        let cells = self
            .rows
            .get(index)
            .map(|row| {
                row.iter()
                    .map(|cell| cell.as_ref().map(|s| s.iter().cloned().collect()).unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default();
        RouteRow::new(index, cells)
    }

    /// Remove the handle with identifier `id` from wherever it is stored.
    pub fn remove(&mut self, id: &Id) -> Option<NodeHandle> {
        let row = self.local.id().index_of_msdd(id, self.base_bits)?;
        let column = id.digit(row, self.base_bits);
        self.rows[row][column].as_mut()?.remove(id)
    }

    /// The stored handle with identifier `id`.
    pub fn find(&self, id: &Id) -> Option<NodeHandle> {
        let row = self.local.id().index_of_msdd(id, self.base_bits)?;
        let column = id.digit(row, self.base_bits);
        self.rows[row][column]
            .as_ref()?
            .iter()
            .find(|h| &h.id() == id)
            .cloned()
    }

    /// Drop dead handles from every cell.
    pub fn cull_dead(&mut self) -> usize {
        self.rows
            .iter_mut()
            .flatten()
            .flatten()
            .map(RouteSet::cull_dead)
            .sum()
    }

    /// Every stored handle.
    pub fn handles(&self) -> impl Iterator<Item = &NodeHandle> {
        self.rows.iter().flatten().flatten().flat_map(RouteSet::iter)
    }

    /// Number of stored handles.
    pub fn size(&self) -> usize {
        self.handles().count()
    }

    /// Number of populated cells in each row, lowest row first.
    pub fn row_occupancy(&self) -> Vec<usize> {
        self.rows
            .iter()
            .map(|row| row.iter().flatten().filter(|s| !s.is_empty()).count())
            .collect()
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTable")
            .field("local", &self.local.id())
            .field("base_bits", &self.base_bits)
            .field("size", &self.size())
            .finish()
    }
}
