//! In-memory dataset adaptor: libsvm-style instances plus per-label counts.
//!
//! The dataset is immutable after construction and freely shared by
//! reference across training threads; only `clear`-free mutation (none
//! exists) would require exclusive access.

use cpm_common::{Error, Result};
use cpm_sparse::SparseVector;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// One `(label, sparse features, class-local position)` triple.
///
/// `pos_id` is the 0-based index of this instance among all instances
/// sharing its `label` — for the outer label that is the "positive id"
/// the training engine indexes `assignments`/`occupancy` by; for every
/// other label it is simply unused.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Signed class label.
    pub label: i64,
    /// Feature vector.
    pub x: SparseVector,
    /// 0-based position among instances sharing `label`.
    pub pos_id: usize,
}

/// A loaded collection of [`Instance`]s with the dimension and per-label
/// counts needed to size a training run.
pub struct Dataset {
    dimensions: u32,
    instances: Vec<Instance>,
    counts_per_label: HashMap<i64, usize>,
}

impl Dataset {
    /// Load a libsvm-formatted text file. `n_instances_hint` only sizes the
    /// initial allocation. A line of length ≤ 4 characters, or EOF, ends
    /// input.
    pub fn from_libsvm_file(path: impl AsRef<Path>, n_instances_hint: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let reader = BufReader::with_capacity(8 * 1024 * 1024, file);

        let mut instances = Vec::with_capacity(n_instances_hint);
        let mut counts_per_label: HashMap<i64, usize> = HashMap::new();
        let mut dimensions: u32 = 0;

        for line in reader.lines() {
            let line = line.map_err(|e| Error::io(path, e))?;
            if line.len() <= 4 {
                break;
            }

            let space = line.find(' ').ok_or_else(|| {
                Error::malformed(path.display().to_string(), "expected ' ' after label")
            })?;
            let label: i64 = line[..space].parse().map_err(|_| {
                Error::malformed(path.display().to_string(), format!("bad label {:?}", &line[..space]))
            })?;

            let cid = {
                let entry = counts_per_label.entry(label).or_insert(0);
                let cid = *entry;
                *entry += 1;
                cid
            };

            let sv = SparseVector::parse_libsvm_body(&line[space + 1..])?;
            dimensions = dimensions.max(sv.max_index());
            instances.push(Instance {
                label,
                x: sv,
                pos_id: cid,
            });
        }

        instances.shrink_to_fit();
        tracing::debug!(
            n_instances = instances.len(),
            dimensions = dimensions + 1,
            "loaded libsvm dataset"
        );

        Ok(Self {
            dimensions: dimensions + 1,
            instances,
            counts_per_label,
        })
    }

    /// Build from dense in-memory rows: `data` is `n_instances * n_dimensions`
    /// row-major, `labels` has `n_instances` entries.
    pub fn from_dense(data: &[f32], labels: &[i64], n_dimensions: usize) -> Result<Self> {
        if labels.is_empty() || data.len() != labels.len() * n_dimensions {
            return Err(Error::InvalidArgument(
                "data length must equal labels.len() * n_dimensions".into(),
            ));
        }

        let mut instances = Vec::with_capacity(labels.len());
        let mut counts_per_label: HashMap<i64, usize> = HashMap::new();

        for (i, &label) in labels.iter().enumerate() {
            let cid = {
                let entry = counts_per_label.entry(label).or_insert(0);
                let cid = *entry;
                *entry += 1;
                cid
            };
            let row = &data[i * n_dimensions..(i + 1) * n_dimensions];
            instances.push(Instance {
                label,
                x: SparseVector::from_dense(row),
                pos_id: cid,
            });
        }

        Ok(Self {
            dimensions: n_dimensions as u32,
            instances,
            counts_per_label,
        })
    }

    /// Build from CSR-style sparse in-memory rows: `indptr` has
    /// `n_instances + 1` entries; row `i` spans
    /// `indices[indptr[i]..indptr[i+1]]` / `data[indptr[i]..indptr[i+1]]`.
    pub fn from_csr(
        data: &[f32],
        indices: &[u32],
        indptr: &[usize],
        labels: &[i64],
    ) -> Result<Self> {
        if indptr.len() < 1 || indptr.len() - 1 != labels.len() {
            return Err(Error::InvalidArgument(
                "indptr.len() - 1 must equal labels.len()".into(),
            ));
        }

        let mut instances = Vec::with_capacity(labels.len());
        let mut counts_per_label: HashMap<i64, usize> = HashMap::new();
        let mut dimensions: u32 = 0;

        for i in 0..labels.len() {
            let label = labels[i];
            let cid = {
                let entry = counts_per_label.entry(label).or_insert(0);
                let cid = *entry;
                *entry += 1;
                cid
            };
            let start = indptr[i];
            let end = indptr[i + 1];
            let sv = SparseVector::from_parallel(&indices[start..end], &data[start..end])?;
            dimensions = dimensions.max(sv.max_index());
            instances.push(Instance {
                label,
                x: sv,
                pos_id: cid,
            });
        }

        Ok(Self {
            dimensions: dimensions + 1,
            instances,
            counts_per_label,
        })
    }

    /// Feature-space dimension (1 + the largest index seen).
    pub fn dimensions(&self) -> u32 {
        self.dimensions
    }

    /// Number of loaded instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True if there are no instances.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instance at position `i`.
    pub fn instance(&self, i: usize) -> &Instance {
        &self.instances[i]
    }

    /// All instances in load order.
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Number of instances carrying `label`.
    pub fn count_for_label(&self, label: i64) -> usize {
        self.counts_per_label.get(&label).copied().unwrap_or(0)
    }

    /// The full per-label count table.
    pub fn counts_per_label(&self) -> &HashMap<i64, usize> {
        &self.counts_per_label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_libsvm_file_and_tracks_per_label_counts() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "1 1:1.0 3:2.0").unwrap();
        writeln!(f, "-1 2:-1.0").unwrap();
        writeln!(f, "1 0:5.0").unwrap();
        f.flush().unwrap();

        let ds = Dataset::from_libsvm_file(f.path(), 16).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.dimensions(), 4);
        assert_eq!(ds.count_for_label(1), 2);
        assert_eq!(ds.count_for_label(-1), 1);
        assert_eq!(ds.instance(0).pos_id, 0);
        assert_eq!(ds.instance(2).pos_id, 1);
    }

    #[test]
    fn short_line_terminates_input() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "1 1:1.0").unwrap();
        writeln!(f, "1").unwrap();
        writeln!(f, "1 2:2.0").unwrap();
        f.flush().unwrap();

        let ds = Dataset::from_libsvm_file(f.path(), 16).unwrap();
        assert_eq!(ds.len(), 1);
    }

    #[test]
    fn from_dense_rejects_mismatched_length() {
        let err = Dataset::from_dense(&[1.0, 2.0, 3.0], &[1, 1], 2).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn from_csr_tracks_dimensions() {
        let ds = Dataset::from_csr(
            &[1.0, 2.0, 3.0],
            &[0, 2, 5],
            &[0, 1, 3],
            &[1, -1],
        )
        .unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.dimensions(), 6);
    }
}
