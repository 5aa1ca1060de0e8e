// Copyright 2022 Singularity Data
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Read-side data model: cells and assembled rows.

use std::cmp::Ordering;

use bytes::Bytes;
use cellstore_pb::v1 as pb;

/// A single versioned value of one column. Immutable once emitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub row_key: Bytes,
    pub family: String,
    pub qualifier: Bytes,
    pub timestamp_micros: i64,
    pub labels: Vec<String>,
    pub value: Bytes,
}

impl Cell {
    /// Native cell order: family ascending, qualifier ascending, timestamp
    /// descending (newest first).
    fn native_cmp(&self, other: &Self) -> Ordering {
        self.family
            .cmp(&other.family)
            .then_with(|| self.qualifier.cmp(&other.qualifier))
            .then_with(|| other.timestamp_micros.cmp(&self.timestamp_micros))
    }
}

impl PartialOrd for Cell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cell {
    fn cmp(&self, other: &Self) -> Ordering {
        self.native_cmp(other)
    }
}

/// A complete logical row: a key plus its cells in native order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    key: Bytes,
    cells: Vec<Cell>,
}

impl Row {
    pub fn new(key: Bytes, mut cells: Vec<Cell>) -> Self {
        // Stable sort keeps the server's relative order for equal cells.
        cells.sort();
        Self { key, cells }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Cells restricted to a family, and optionally to one qualifier.
    pub fn get_cells<'a>(
        &'a self,
        family: &'a str,
        qualifier: Option<&'a [u8]>,
    ) -> impl Iterator<Item = &'a Cell> + 'a {
        self.cells.iter().filter(move |c| {
            c.family == family && qualifier.map_or(true, |q| c.qualifier.as_ref() == q)
        })
    }

    /// Flattens the materialized wire form returned by unary row RPCs.
    pub(crate) fn from_pb(row: pb::ProtoRow) -> Self {
        let key = row.key;
        let mut cells = Vec::new();
        for family in row.families {
            for column in family.columns {
                for cell in column.cells {
                    cells.push(Cell {
                        row_key: key.clone(),
                        family: family.name.clone(),
                        qualifier: column.qualifier.clone(),
                        timestamp_micros: cell.timestamp_micros,
                        labels: cell.labels,
                        value: cell.value,
                    });
                }
            }
        }
        Self::new(key, cells)
    }
}

impl std::ops::Index<usize> for Row {
    type Output = Cell;

    fn index(&self, index: usize) -> &Cell {
        &self.cells[index]
    }
}

impl IntoIterator for Row {
    type IntoIter = std::vec::IntoIter<Cell>;
    type Item = Cell;

    fn into_iter(self) -> Self::IntoIter {
        self.cells.into_iter()
    }
}
