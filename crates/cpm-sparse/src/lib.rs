//! Immutable sorted sparse vectors with a cached L2 norm.
//!
//! Mirrors the data shape used throughout the CPM training engine: a
//! strictly-increasing sequence of `(index, value)` cells plus a cached norm
//! so the engine never has to recompute `||x||` on the hot SGD path.

use cpm_common::{Error, Result};

/// One nonzero cell of a [`SparseVector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    /// Dimension index.
    pub index: u32,
    /// Value at that dimension.
    pub value: f32,
}

/// A sparse vector: sorted, strictly-increasing indices, cached L2 norm.
///
/// Immutable after construction except for [`SparseVector::scale`], which
/// keeps the cached norm consistent with the scaled values.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseVector {
    cells: Vec<Cell>,
    norm: f64,
}

impl SparseVector {
    /// Parse the body of a libsvm-format line (label already stripped):
    /// `idx:val idx:val … [# comment]`. Stops at `\n`, `\r`, or `#`.
    /// Indices must be strictly increasing; whitespace between cells is
    /// tolerated.
    pub fn parse_libsvm_body(body: &str) -> Result<Self> {
        let mut cells = Vec::new();
        let mut norm = 0.0f64;
        let mut last_index: i64 = -1;

        let mut rest = body;
        loop {
            rest = rest.trim_start_matches(|c: char| c == ' ' || c == '\t');
            let Some(first) = rest.chars().next() else {
                break;
            };
            if first == '#' || first == '\n' || first == '\r' {
                break;
            }

            let token_end = rest
                .find(|c: char| c == ' ' || c == '\t' || c == '#' || c == '\n' || c == '\r')
                .unwrap_or(rest.len());
            let token = &rest[..token_end];

            let Some(colon) = token.find(':') else {
                return Err(Error::malformed(
                    "libsvm body",
                    format!("missing ':' in cell {token:?}"),
                ));
            };
            let index: u32 = token[..colon].parse().map_err(|_| {
                Error::malformed("libsvm body", format!("bad index in cell {token:?}"))
            })?;
            let value: f32 = token[colon + 1..].parse().map_err(|_| {
                Error::malformed("libsvm body", format!("bad value in cell {token:?}"))
            })?;

            if i64::from(index) <= last_index {
                return Err(Error::malformed(
                    "libsvm body",
                    "indices must be sorted by strictly increasing order",
                ));
            }
            last_index = i64::from(index);

            norm += f64::from(value) * f64::from(value);
            cells.push(Cell { index, value });

            rest = &rest[token_end..];
        }

        Ok(Self {
            cells,
            norm: norm.sqrt(),
        })
    }

    /// Build from a dense array, emitting a cell only for nonzero entries.
    pub fn from_dense(data: &[f32]) -> Self {
        let mut cells = Vec::new();
        let mut norm = 0.0f64;
        for (i, &value) in data.iter().enumerate() {
            if value != 0.0 {
                cells.push(Cell {
                    index: i as u32,
                    value,
                });
                norm += f64::from(value) * f64::from(value);
            }
        }
        Self {
            cells,
            norm: norm.sqrt(),
        }
    }

    /// Build from parallel `(indices, values)` arrays. Indices must be
    /// strictly increasing; zeros are kept (unlike [`SparseVector::from_dense`]).
    pub fn from_parallel(indices: &[u32], values: &[f32]) -> Result<Self> {
        if indices.len() != values.len() {
            return Err(Error::InvalidArgument(
                "indices and values must have the same length".into(),
            ));
        }

        let mut cells = Vec::with_capacity(indices.len());
        let mut norm = 0.0f64;
        let mut last_index: i64 = -1;

        for (&index, &value) in indices.iter().zip(values.iter()) {
            if i64::from(index) <= last_index {
                return Err(Error::malformed(
                    "parallel arrays",
                    "indices must be sorted by strictly increasing order",
                ));
            }
            last_index = i64::from(index);
            norm += f64::from(value) * f64::from(value);
            cells.push(Cell { index, value });
        }

        Ok(Self {
            cells,
            norm: norm.sqrt(),
        })
    }

    /// Cells in increasing index order.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Number of nonzero cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True if there are no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Cached `||x||_2`.
    pub fn norm(&self) -> f64 {
        self.norm
    }

    /// Largest nonzero dimension index, or 0 if empty.
    pub fn max_index(&self) -> u32 {
        self.cells.last().map(|c| c.index).unwrap_or(0)
    }

    /// In-place scalar multiply: scales every value and the cached norm.
    pub fn scale(&mut self, weight: f32) {
        for cell in &mut self.cells {
            cell.value *= weight;
        }
        self.norm *= f64::from(weight);
    }

    /// Re-emit the libsvm textual form: `idx:val idx:val … \n`.
    ///
    /// Round-trips through [`SparseVector::parse_libsvm_body`] exactly when
    /// values survive float formatting (the cached norm is never emitted).
    pub fn to_libsvm(&self) -> String {
        let mut out = String::new();
        for cell in &self.cells {
            out.push_str(&cell.index.to_string());
            out.push(':');
            out.push_str(&cell.value.to_string());
            out.push(' ');
        }
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comment_and_norm() {
        let sv = SparseVector::parse_libsvm_body("3:2.5 7:-1.0 # comment").unwrap();
        assert_eq!(sv.cells(), &[Cell { index: 3, value: 2.5 }, Cell { index: 7, value: -1.0 }]);
        assert!((sv.norm() - (2.5f64 * 2.5 + 1.0).sqrt()).abs() < 1e-9);
        assert_eq!(sv.max_index(), 7);
    }

    #[test]
    fn rejects_non_increasing_indices() {
        let err = SparseVector::parse_libsvm_body("3:1.0 2:1.0").unwrap_err();
        assert!(matches!(err, Error::MalformedInput { .. }));
    }

    #[test]
    fn rejects_missing_colon() {
        let err = SparseVector::parse_libsvm_body("3 4:1.0").unwrap_err();
        assert!(matches!(err, Error::MalformedInput { .. }));
    }

    #[test]
    fn from_dense_skips_zeros() {
        let sv = SparseVector::from_dense(&[0.0, 1.5, 0.0, -2.0]);
        assert_eq!(sv.cells(), &[Cell { index: 1, value: 1.5 }, Cell { index: 3, value: -2.0 }]);
    }

    #[test]
    fn from_parallel_keeps_zeros() {
        let sv = SparseVector::from_parallel(&[0, 1, 2], &[0.0, 1.0, 0.0]).unwrap();
        assert_eq!(sv.len(), 3);
    }

    #[test]
    fn scale_updates_values_and_norm() {
        let mut sv = SparseVector::parse_libsvm_body("1:2.0").unwrap();
        let before = sv.norm();
        sv.scale(3.0);
        assert_eq!(sv.cells()[0].value, 6.0);
        assert!((sv.norm() - before * 3.0).abs() < 1e-9);
    }

    #[test]
    fn libsvm_round_trip() {
        let sv = SparseVector::parse_libsvm_body("3:2.5 7:-1.0").unwrap();
        let text = sv.to_libsvm();
        let back = SparseVector::parse_libsvm_body(&text).unwrap();
        assert_eq!(sv.cells(), back.cells());
    }

    #[test]
    fn empty_max_index_is_zero() {
        let sv = SparseVector::parse_libsvm_body("").unwrap();
        assert_eq!(sv.max_index(), 0);
    }
}
