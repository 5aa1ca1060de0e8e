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

//! Chunk-to-row assembly.
//!
//! [`ChunkMerger`] consumes the cell chunks of one read attempt and emits
//! complete rows. It is single-use: a retry discards the merger along with
//! any partial row and starts over with a fresh one. Any contract violation
//! in the chunk stream surfaces as [`Error::InvalidChunk`] and is never
//! retried.

use std::mem;

use bytes::Bytes;
use cellstore_pb::v1 as pb;

use crate::error::{Error, Result};
use crate::row::{Cell, Row};

fn invalid(message: &str) -> Error {
    Error::InvalidChunk(message.to_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MergeState {
    /// No partial row buffered. The only terminal state.
    AwaitingNewRow,
    /// A row is open and the previous cell (if any) is complete.
    AwaitingNewCell,
    /// A cell's value is split across chunks and more fragments follow.
    AwaitingCellValue,
}

pub(crate) struct ChunkMerger {
    state: MergeState,
    /// Largest key committed or scanned past; later chunks must exceed it.
    last_seen_key: Option<Bytes>,
    /// Rows this attempt may still commit; overshoot is an invalid chunk.
    remaining_limit: Option<i64>,
    row_key: Bytes,
    cells: Vec<Cell>,
    current_family: Option<String>,
    current_qualifier: Option<Bytes>,
    cell_timestamp: i64,
    cell_labels: Vec<String>,
    value_buf: Vec<u8>,
}

impl ChunkMerger {
    pub fn new(row_limit: Option<i64>) -> Self {
        Self {
            state: MergeState::AwaitingNewRow,
            last_seen_key: None,
            remaining_limit: row_limit,
            row_key: Bytes::new(),
            cells: Vec::new(),
            current_family: None,
            current_qualifier: None,
            cell_timestamp: 0,
            cell_labels: Vec::new(),
            value_buf: Vec::new(),
        }
    }

    /// True iff no partial row is buffered.
    pub fn is_terminal(&self) -> bool {
        self.state == MergeState::AwaitingNewRow
    }

    /// Feeds one chunk through the state machine, returning a row when the
    /// chunk commits one.
    pub fn handle_chunk(&mut self, chunk: pb::CellChunk) -> Result<Option<Row>> {
        if let Some(last) = &self.last_seen_key {
            if !chunk.row_key.is_empty() && chunk.row_key <= *last {
                return Err(invalid("row keys must be strictly increasing"));
            }
        }
        if chunk.reset_row {
            self.handle_reset(&chunk)?;
            return Ok(None);
        }
        match self.state {
            MergeState::AwaitingNewRow => {
                if chunk.row_key.is_empty() {
                    return Err(invalid("new row is missing a row key"));
                }
                self.row_key = chunk.row_key.clone();
                // The first chunk opens both the row and its first cell.
                self.state = MergeState::AwaitingNewCell;
                self.handle_new_cell(&chunk)?;
            }
            MergeState::AwaitingNewCell => self.handle_new_cell(&chunk)?,
            MergeState::AwaitingCellValue => self.handle_cell_value(&chunk)?,
        }
        if chunk.commit_row {
            if self.state != MergeState::AwaitingNewCell {
                return Err(invalid("commit row attempted without finishing the cell"));
            }
            let row = Row::new(self.row_key.clone(), mem::take(&mut self.cells));
            self.last_seen_key = Some(self.row_key.clone());
            if let Some(remaining) = &mut self.remaining_limit {
                *remaining -= 1;
                if *remaining < 0 {
                    return Err(invalid("committed rows exceed the requested row limit"));
                }
            }
            self.reset_row_state();
            return Ok(Some(row));
        }
        Ok(None)
    }

    /// Progress heartbeat: the server scanned up to `key` without producing
    /// chunks. Advances the watermark without emitting a row.
    pub fn handle_last_scanned(&mut self, key: Bytes) -> Result<()> {
        if let Some(last) = &self.last_seen_key {
            if *last >= key {
                return Err(invalid("last scanned row key is out of order"));
            }
        }
        if !self.is_terminal() {
            return Err(invalid("last scanned row key received while a row is in progress"));
        }
        self.last_seen_key = Some(key);
        Ok(())
    }

    /// End-of-stream check: a partial row at this point is a broken stream.
    pub fn finish(&self) -> Result<()> {
        if !self.is_terminal() {
            return Err(invalid("chunk stream ended with a partial row"));
        }
        Ok(())
    }

    fn handle_new_cell(&mut self, chunk: &pb::CellChunk) -> Result<()> {
        // Family and qualifier are sticky within a row; chunks only carry
        // them when they change.
        if let Some(family) = &chunk.family_name {
            self.current_family = Some(family.clone());
            if chunk.qualifier.is_none() {
                return Err(invalid("new column family must specify a qualifier"));
            }
        }
        if let Some(qualifier) = &chunk.qualifier {
            if self.current_family.is_none() {
                return Err(invalid("cell qualifier received without a family"));
            }
            self.current_qualifier = Some(qualifier.clone());
        }
        if !chunk.row_key.is_empty() && chunk.row_key != self.row_key {
            return Err(invalid("row key changed mid row"));
        }
        let family = self
            .current_family
            .clone()
            .ok_or_else(|| invalid("new cell is missing a family"))?;
        let qualifier = self
            .current_qualifier
            .clone()
            .ok_or_else(|| invalid("new cell is missing a qualifier"))?;
        if chunk.value_size > 0 {
            // Split cell: buffer the first fragment and wait for the rest.
            self.cell_timestamp = chunk.timestamp_micros;
            self.cell_labels = chunk.labels.clone();
            self.value_buf.clear();
            self.value_buf.extend_from_slice(&chunk.value);
            self.state = MergeState::AwaitingCellValue;
        } else {
            self.cells.push(Cell {
                row_key: self.row_key.clone(),
                family,
                qualifier,
                timestamp_micros: chunk.timestamp_micros,
                labels: chunk.labels.clone(),
                value: chunk.value.clone(),
            });
            self.state = MergeState::AwaitingNewCell;
        }
        Ok(())
    }

    fn handle_cell_value(&mut self, chunk: &pb::CellChunk) -> Result<()> {
        if !chunk.row_key.is_empty() {
            return Err(invalid("value fragment carried a row key"));
        }
        if chunk.family_name.is_some() {
            return Err(invalid("value fragment carried a family name"));
        }
        if chunk.qualifier.is_some() {
            return Err(invalid("value fragment carried a qualifier"));
        }
        if chunk.timestamp_micros != 0 {
            return Err(invalid("value fragment carried a timestamp"));
        }
        if !chunk.labels.is_empty() {
            return Err(invalid("value fragment carried labels"));
        }
        self.value_buf.extend_from_slice(&chunk.value);
        if chunk.value_size == 0 {
            let family = self
                .current_family
                .clone()
                .ok_or_else(|| invalid("split cell is missing a family"))?;
            let qualifier = self
                .current_qualifier
                .clone()
                .ok_or_else(|| invalid("split cell is missing a qualifier"))?;
            self.cells.push(Cell {
                row_key: self.row_key.clone(),
                family,
                qualifier,
                timestamp_micros: self.cell_timestamp,
                labels: mem::take(&mut self.cell_labels),
                value: Bytes::from(mem::take(&mut self.value_buf)),
            });
            self.state = MergeState::AwaitingNewCell;
        }
        Ok(())
    }

    fn handle_reset(&mut self, chunk: &pb::CellChunk) -> Result<()> {
        if self.state == MergeState::AwaitingNewRow {
            return Err(invalid("reset chunk received when no row is in progress"));
        }
        if !chunk.row_key.is_empty()
            || chunk.family_name.is_some()
            || chunk.qualifier.is_some()
            || chunk.timestamp_micros != 0
            || !chunk.labels.is_empty()
            || !chunk.value.is_empty()
            || chunk.value_size != 0
            || chunk.commit_row
        {
            return Err(invalid("reset chunk must carry no other data"));
        }
        self.reset_row_state();
        Ok(())
    }

    fn reset_row_state(&mut self) {
        self.state = MergeState::AwaitingNewRow;
        self.row_key = Bytes::new();
        self.cells.clear();
        self.current_family = None;
        self.current_qualifier = None;
        self.cell_timestamp = 0;
        self.cell_labels.clear();
        self.value_buf.clear();
    }
}
