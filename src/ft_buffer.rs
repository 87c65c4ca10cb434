//! Factorized Tuple Buffer: a row-oriented staging buffer whose schema is
//! a fixed sequence of columns, each holding exactly one scalar per row
//! (no unflat/multi-valued cells). Used both for the single wide table of
//! staged-insert rels and for the narrower per-property update tables.

use crate::property::{PropertyValue, ValueVector};
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct FactorizedTupleBuffer {
    num_columns: usize,
    columns: Vec<Vec<PropertyValue>>,
}

impl FactorizedTupleBuffer {
    pub fn new(num_columns: usize) -> Self {
        Self {
            num_columns,
            columns: (0..num_columns).map(|_| Vec::new()).collect(),
        }
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(Vec::len).unwrap_or(0)
    }

    /// Appends one row and returns the new row count.
    pub fn append(&mut self, row: Vec<PropertyValue>) -> Result<usize> {
        if row.len() != self.num_columns {
            return Err(Error::Logic("row width does not match factorized table schema"));
        }
        for (column, value) in self.columns.iter_mut().zip(row) {
            column.push(value);
        }
        Ok(self.num_rows())
    }

    /// Copies `num` cells of each requested column, following
    /// `row_indices[start_elem..start_elem + num]`, into fresh output
    /// vectors — the shape the query executor's columnar batch expects.
    pub fn lookup(
        &self,
        columns: &[usize],
        row_indices: &[usize],
        start_elem: usize,
        num: usize,
    ) -> Result<Vec<ValueVector>> {
        let window = row_indices
            .get(start_elem..start_elem + num)
            .ok_or(Error::Logic("row index window out of range"))?;
        let mut out = Vec::with_capacity(columns.len());
        for &col_idx in columns {
            let column = self
                .columns
                .get(col_idx)
                .ok_or(Error::Logic("column index out of range"))?;
            let mut vv = ValueVector::with_len(num);
            for (i, &row_idx) in window.iter().enumerate() {
                let value = column
                    .get(row_idx)
                    .cloned()
                    .ok_or(Error::Logic("row index out of range"))?;
                vv.set(i, value);
            }
            out.push(vv);
        }
        Ok(out)
    }

    pub fn update_flat_cell(&mut self, row_idx: usize, col_idx: usize, value: PropertyValue) -> Result<()> {
        let cell = self
            .columns
            .get_mut(col_idx)
            .ok_or(Error::Logic("column index out of range"))?
            .get_mut(row_idx)
            .ok_or(Error::Logic("row index out of range"))?;
        *cell = value;
        Ok(())
    }

    pub fn cell(&self, col_idx: usize, row_idx: usize) -> Option<&PropertyValue> {
        self.columns.get(col_idx)?.get(row_idx)
    }

    /// Linear scan for `value` in `col_idx`; returns `-1` (not the
    /// caller's problem to unwrap an `Option`) when absent, matching the
    /// sentinel contract callers rely on for "staged or not".
    pub fn find_value_in_flat_column(&self, col_idx: usize, value: &PropertyValue) -> i64 {
        self.columns
            .get(col_idx)
            .and_then(|column| column.iter().position(|v| v == value))
            .map(|idx| idx as i64)
            .unwrap_or(-1)
    }
}
