//! The online training engine: SGD updates, entropy-constrained attribution,
//! and the plain-text model file format.

use cpm_common::{Error, Result};
use cpm_dataset::Instance;
use cpm_matrix::DenseMatrix;
use cpm_sparse::SparseVector;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const PEPSILON: f64 = 1e-6;

/// One convex-polytope-machine classifier: K sub-hyperplanes, attribution
/// bookkeeping for positives, and the SGD step.
pub struct Cpm {
    outer_label: i64,
    k: u16,
    lambda: f64,
    entropy: f64,
    negative_cost: f64,
    positive_cost: f64,
    n_positives: usize,
    seed: u64,
    margin: f64,

    w: DenseMatrix,
    score: Vec<f64>,
    iter: u64,

    /// `-1` means never assigned.
    assignments: Vec<i32>,
    occupancy: Vec<u64>,
    distinct_p: u64,
}

impl Cpm {
    /// Construct a fresh engine. `k` in `[1, 65535]`, `lambda > 0`,
    /// `entropy >= 0` (nats), `negative_cost`/`positive_cost > 0`.
    pub fn new(
        outer_label: i64,
        dimensions: u32,
        k: u16,
        lambda: f64,
        entropy: f64,
        negative_cost: f64,
        positive_cost: f64,
        n_positives: usize,
        seed: u64,
    ) -> Result<Self> {
        if k == 0 {
            return Err(Error::InvalidArgument("k must be >= 1".into()));
        }
        Ok(Self {
            outer_label,
            k,
            lambda,
            entropy,
            negative_cost,
            positive_cost,
            n_positives,
            seed,
            margin: 1.0,
            w: DenseMatrix::new(dimensions, k),
            score: vec![0.0; k as usize],
            iter: 0,
            assignments: vec![-1; n_positives],
            occupancy: vec![0; k as usize],
            distinct_p: 0,
        })
    }

    /// Number of sub-classifiers.
    pub fn k(&self) -> u16 {
        self.k
    }

    /// The label treated as the polytope's interior (positive class).
    pub fn outer_label(&self) -> i64 {
        self.outer_label
    }

    /// Number of SGD steps taken so far.
    pub fn iter(&self) -> u64 {
        self.iter
    }

    /// The underlying weight bank.
    pub fn w(&self) -> &DenseMatrix {
        &self.w
    }

    /// Scratch scores from the last `predict`/`one_step` call.
    pub fn scores(&self) -> &[f64] {
        &self.score
    }

    /// Assignment history for positives (`-1` = never assigned).
    pub fn assignments(&self) -> &[i32] {
        &self.assignments
    }

    /// Current occupancy per classifier.
    pub fn occupancy(&self) -> &[u64] {
        &self.occupancy
    }

    /// Evaluate `W . x`, returning `(max_score, argmax)`. Fills the scratch
    /// score buffer, which stays readable until the next call.
    pub fn predict(&mut self, s: &SparseVector) -> (f64, u16) {
        self.score = self.w.inner(s, None);
        argmax(&self.score)
    }

    /// Perform one SGD step. Returns `(max_score, exclusion_loss, assignment)`.
    pub fn one_step(&mut self, instance: &Instance) -> Result<(f64, f64, u16)> {
        let eta = 1.0 / (self.lambda * (self.iter as f64 + 2.0));
        self.score = self.w.inner(&instance.x, None);

        let (max_score, exclusion_loss, assignment) = if instance.label == self.outer_label {
            let (imax, true_imax) = self.heuristic_max(&instance.x, instance.pos_id);
            let max_score = self.score[imax as usize];

            let exclusion_loss: f64 = self
                .score
                .iter()
                .enumerate()
                .filter(|&(i, _)| i != imax as usize)
                .map(|(_, &s)| s.max(0.0))
                .sum();

            if max_score < self.margin {
                self.w
                    .add_inplace_one(&instance.x, eta * self.positive_cost, imax);
            }

            self.set_history(instance.pos_id, true_imax)?;
            (max_score, exclusion_loss, true_imax)
        } else {
            let mut grad_mul = vec![0.0f64; self.k as usize];
            let mut active = false;
            let mut imax = 0u16;
            let mut max_score = self.score[0];

            for i in 0..self.k as usize {
                if self.score[i] > -self.margin {
                    grad_mul[i] = -eta * self.negative_cost;
                    active = true;
                }
                if self.score[i] > max_score {
                    imax = i as u16;
                    max_score = self.score[i];
                }
            }

            if active {
                self.w.add_inplace_all(&instance.x, &grad_mul);
            }

            (max_score, 0.0, imax)
        };

        let coeff = (1.0 - eta * self.lambda).max(0.0);
        self.w.mul_inplace_scalar(coeff);
        self.iter += 1;

        Ok((max_score, exclusion_loss, assignment))
    }

    /// Choose which classifier to credit a positive to, possibly overriding
    /// the natural argmax to keep the assignment distribution's entropy at
    /// or above the configured floor. Returns `(attributed, true_argmax)`.
    fn heuristic_max(&self, _s: &SparseVector, pos_id: usize) -> (u16, u16) {
        let (_, true_imax) = argmax(&self.score);

        let n = self.distinct_p as f64;
        if self.entropy <= 0.0 || n < self.k as f64 * 5.0 {
            return (true_imax, true_imax);
        }

        let old = self.assignments[pos_id];

        let mut h_old = 0.0f64;
        let mut h_new = 0.0f64;

        for i in 0..self.k as usize {
            let pi = self.occupancy[i] as f64 / n;
            let hpi = if pi > PEPSILON { -pi * pi.ln() } else { 0.0 };
            h_old += hpi;

            if old != -1 {
                let old = old as usize;
                let true_imax_i = true_imax as usize;
                if i == old && old == true_imax_i {
                    h_new += hpi;
                } else if i == old {
                    let pold = (self.occupancy[i] as f64 - 1.0) / n;
                    h_new += -pold * pold.ln();
                } else if i == true_imax_i {
                    let pnew = (self.occupancy[i] as f64 + 1.0) / n;
                    h_new += -pnew * pnew.ln();
                } else {
                    h_new += hpi;
                }
            } else if i == true_imax as usize {
                let pi = (self.occupancy[i] as f64 + 1.0) / (n + 1.0);
                h_new += -pi * pi.ln();
            } else {
                let pi = self.occupancy[i] as f64 / (n + 1.0);
                h_new += -pi * pi.ln();
            }
        }

        if h_new >= self.entropy || h_old < h_new {
            return (true_imax, true_imax);
        }

        if old != -1 {
            let old = old as usize;
            let mut imax = 0u16;
            let mut max_score = f64::NEG_INFINITY;
            for i in 0..self.k as usize {
                if (self.occupancy[i] as usize) < self.occupancy[old] as usize
                    && max_score < self.score[i]
                {
                    max_score = self.score[i];
                    imax = i as u16;
                }
            }
            (imax, true_imax)
        } else {
            let mut imax = 0u16;
            let mut max_score = f64::NEG_INFINITY;
            let threshold = self.k as f64 / n;
            for i in 0..self.k as usize {
                if (self.occupancy[i] as f64) < threshold && max_score < self.score[i] {
                    max_score = self.score[i];
                    imax = i as u16;
                }
            }
            (imax, true_imax)
        }
    }

    /// Record that positive `pos_id` is now attributed to `k_true`.
    pub fn set_history(&mut self, pos_id: usize, k_true: u16) -> Result<()> {
        if pos_id >= self.n_positives {
            return Err(Error::InvalidArgument(format!(
                "pos_id {pos_id} out of range (n_positives = {})",
                self.n_positives
            )));
        }
        let old = self.assignments[pos_id];
        self.assignments[pos_id] = k_true as i32;
        self.occupancy[k_true as usize] += 1;
        if old == -1 {
            self.distinct_p += 1;
        } else {
            self.occupancy[old as usize] -= 1;
        }
        Ok(())
    }

    /// Reset `iter`, `distinct_p`, and `W` to their initial state.
    /// `assignments` and `occupancy` are left untouched — matching upstream
    /// behavior (see `DESIGN.md`), a subsequent `set_history` will still see
    /// the stale counts.
    pub fn clear(&mut self) {
        self.iter = 0;
        self.distinct_p = 0;
        self.w.clear();
    }

    /// Write the plain-text model file described by the format's v2 layout.
    pub fn write_model(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut out = BufWriter::new(file);

        writeln!(out, "version: 2").map_err(|e| Error::io(path, e))?;
        writeln!(out).map_err(|e| Error::io(path, e))?;
        writeln!(out, "### DATASET ###").map_err(|e| Error::io(path, e))?;
        writeln!(out, "outer label: {}", self.outer_label).map_err(|e| Error::io(path, e))?;
        writeln!(out, "outer instances: {}", self.n_positives).map_err(|e| Error::io(path, e))?;
        writeln!(out, "dimensions: {}", self.w.dimensions()).map_err(|e| Error::io(path, e))?;
        writeln!(out).map_err(|e| Error::io(path, e))?;
        writeln!(out, "### CPM PARAMETERS ###").map_err(|e| Error::io(path, e))?;
        writeln!(out, "hyperplanes: {}", self.k).map_err(|e| Error::io(path, e))?;
        writeln!(out, "iterations: {}", self.iter.wrapping_sub(1)).map_err(|e| Error::io(path, e))?;
        writeln!(out, "lambda: {}", self.lambda).map_err(|e| Error::io(path, e))?;
        writeln!(out, "entropy: {}", self.entropy).map_err(|e| Error::io(path, e))?;
        writeln!(out, "cost ratio: {}", self.negative_cost / self.positive_cost)
            .map_err(|e| Error::io(path, e))?;
        writeln!(out, "seed: {}", self.seed).map_err(|e| Error::io(path, e))?;
        writeln!(out).map_err(|e| Error::io(path, e))?;
        writeln!(out, "### ASSIGNMENTS COUNTS ###").map_err(|e| Error::io(path, e))?;
        let active = self.occupancy.iter().filter(|&&c| c > 0).count();
        writeln!(out, "active classifiers: {active}").map_err(|e| Error::io(path, e))?;
        write!(out, "counts: ").map_err(|e| Error::io(path, e))?;
        for c in &self.occupancy {
            write!(out, "{c} ").map_err(|e| Error::io(path, e))?;
        }
        writeln!(out).map_err(|e| Error::io(path, e))?;
        writeln!(out).map_err(|e| Error::io(path, e))?;
        writeln!(out, "### MODEL ###").map_err(|e| Error::io(path, e))?;
        writeln!(out, "encoding: dense").map_err(|e| Error::io(path, e))?;
        self.w.serialize_body(&mut out)?;

        Ok(())
    }

    /// Read a v2 model file. Faithfully reproduces the upstream quirk: `k`
    /// is rebuilt from the *active classifiers* count rather than the
    /// stored `hyperplanes` field, and the occupancy `counts:` line is
    /// skipped entirely rather than restored (occupancy starts at all
    /// zero). See `DESIGN.md`.
    pub fn read_model(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut reader = BufReader::new(file);
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|e| Error::io(path, e))?;

        let mut rest = text.as_str();

        let version: i64 = next_field(&mut rest, path)?;
        if version != 2 {
            return Err(Error::CorruptModel {
                path: path.to_path_buf(),
                detail: format!("unsupported model file version {version}"),
            });
        }

        let outer_label: i64 = next_field(&mut rest, path)?;
        let n_positives: usize = next_field(&mut rest, path)?;
        let dimensions: u32 = next_field(&mut rest, path)?;
        let _hyperplanes: i64 = next_field(&mut rest, path)?;
        let _iterations: i64 = next_field(&mut rest, path)?;
        let lambda: f64 = next_field(&mut rest, path)?;
        let entropy: f64 = next_field(&mut rest, path)?;
        let cost_ratio: f64 = next_field(&mut rest, path)?;
        let seed: u64 = next_field(&mut rest, path)?;
        let active: u16 = next_field(&mut rest, path)?;

        // Skip "counts: ... " entirely, then skip "encoding: dense" down to
        // its trailing newline, landing right before the numeric body.
        skip_to_colon(&mut rest, path)?; // past "counts:"
        skip_to_colon(&mut rest, path)?; // past "encoding:"
        skip_to_newline(&mut rest);

        // Built directly rather than through `Cpm::new`: that constructor
        // rejects `k == 0`, but a model saved with zero active classifiers
        // must round-trip to `k == 0` here rather than being coerced to 1.
        // See DESIGN.md.
        let k = active;
        let mut cpm = Cpm {
            outer_label,
            k,
            lambda,
            entropy,
            negative_cost: cost_ratio / (1.0 + cost_ratio),
            positive_cost: 1.0 / (1.0 + cost_ratio),
            n_positives,
            seed,
            margin: 1.0,
            w: DenseMatrix::new(dimensions, k),
            score: vec![0.0; k as usize],
            iter: 0,
            assignments: vec![-1; n_positives],
            occupancy: vec![0; k as usize],
            distinct_p: 0,
        };

        let mut body = rest.as_bytes();
        cpm.w.deserialize_body(&mut body)?;

        Ok(cpm)
    }
}

/// Shannon entropy, in bits, of the distribution `counts[i] / total`.
/// Zero-count cells contribute nothing.
pub fn entropy_bits(counts: &[u64], total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    let mut h = 0.0f64;
    for &c in counts {
        if c > 0 {
            let p = c as f64 / total;
            h -= p * p.ln();
        }
    }
    h / std::f64::consts::LN_2
}

fn argmax(score: &[f64]) -> (u16, u16) {
    let mut imax = 0u16;
    let mut max_score = score[0];
    for (i, &s) in score.iter().enumerate().skip(1) {
        if max_score < s {
            max_score = s;
            imax = i as u16;
        }
    }
    (imax, imax)
}

fn skip_to_colon<'a>(rest: &mut &'a str, path: &Path) -> Result<()> {
    let pos = rest.find(':').ok_or_else(|| Error::CorruptModel {
        path: path.to_path_buf(),
        detail: "expected ':' in model header".into(),
    })?;
    *rest = &rest[pos + 1..];
    Ok(())
}

fn skip_to_newline(rest: &mut &str) {
    if let Some(pos) = rest.find('\n') {
        *rest = &rest[pos + 1..];
    } else {
        *rest = "";
    }
}

fn next_field<T: std::str::FromStr>(rest: &mut &str, path: &Path) -> Result<T> {
    skip_to_colon(rest, path)?;
    let trimmed = rest.trim_start();
    let end = trimmed
        .find(|c: char| c.is_whitespace())
        .unwrap_or(trimmed.len());
    let token = &trimmed[..end];
    let value = token.parse().map_err(|_| Error::CorruptModel {
        path: path.to_path_buf(),
        detail: format!("could not parse field value {token:?}"),
    })?;
    *rest = &trimmed[end..];
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpm_dataset::Instance;

    fn pos(pos_id: usize, x: &[f32]) -> Instance {
        Instance {
            label: 1,
            x: SparseVector::from_dense(x),
            pos_id,
        }
    }

    fn neg(x: &[f32]) -> Instance {
        Instance {
            label: -1,
            x: SparseVector::from_dense(x),
            pos_id: 0,
        }
    }

    #[test]
    fn single_classifier_separates_a_trivial_dataset() {
        let mut cpm = Cpm::new(1, 2, 1, 0.1, 0.0, 0.5, 0.5, 1, 0).unwrap();
        for _ in 0..100 {
            cpm.one_step(&pos(0, &[0.0, 1.0])).unwrap();
            cpm.one_step(&neg(&[0.0, -1.0])).unwrap();
        }

        let (score_pos, _) = cpm.predict(&SparseVector::from_dense(&[0.0, 1.0]));
        let (score_neg, _) = cpm.predict(&SparseVector::from_dense(&[0.0, -1.0]));
        assert!(score_pos >= 0.5, "expected score_pos >= 0.5, got {score_pos}");
        assert!(score_neg <= -0.5, "expected score_neg <= -0.5, got {score_neg}");
    }

    #[test]
    fn set_history_rejects_out_of_range_pos_id() {
        let mut cpm = Cpm::new(1, 4, 2, 0.1, 0.0, 0.5, 0.5, 2, 0).unwrap();
        let err = cpm.set_history(5, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn set_history_updates_occupancy_and_distinct_p() {
        let mut cpm = Cpm::new(1, 4, 2, 0.1, 0.0, 0.5, 0.5, 2, 0).unwrap();
        cpm.set_history(0, 1).unwrap();
        assert_eq!(cpm.assignments()[0], 1);
        assert_eq!(cpm.occupancy()[1], 1);
        cpm.set_history(0, 0).unwrap();
        assert_eq!(cpm.occupancy()[1], 0);
        assert_eq!(cpm.occupancy()[0], 1);
    }

    #[test]
    fn clear_resets_iter_but_not_assignments() {
        let mut cpm = Cpm::new(1, 4, 2, 0.1, 0.0, 0.5, 0.5, 2, 0).unwrap();
        cpm.one_step(&pos(0, &[1.0, 0.0, 0.0, 0.0])).unwrap();
        cpm.set_history(1, 0).unwrap();
        cpm.clear();
        assert_eq!(cpm.iter(), 0);
        assert_eq!(cpm.occupancy()[0], 1);
    }

    #[test]
    fn entropy_enforcement_spreads_two_identical_positives() {
        let mut cpm = Cpm::new(1, 2, 2, 0.0001, std::f64::consts::LN_2, 0.5, 0.5, 2, 0).unwrap();
        for _ in 0..10000 {
            cpm.one_step(&pos(0, &[1.0, 1.0])).unwrap();
            cpm.one_step(&pos(1, &[1.0, 1.0])).unwrap();
            cpm.one_step(&neg(&[-1.0, -1.0])).unwrap();
        }
        let occ = cpm.occupancy();
        assert_eq!(occ.iter().sum::<u64>(), 2);
        assert!(occ.iter().all(|&c| c == 1), "occupancy = {occ:?}");
    }

    #[test]
    fn model_round_trips_through_disk() {
        let mut cpm = Cpm::new(1, 2, 1, 0.1, 0.0, 0.5, 0.5, 1, 42).unwrap();
        for _ in 0..100 {
            cpm.one_step(&pos(0, &[0.0, 1.0])).unwrap();
            cpm.one_step(&neg(&[0.0, -1.0])).unwrap();
        }

        let dir = tempfile_dir();
        let path = dir.join("model.txt");
        cpm.write_model(&path).unwrap();
        let mut reloaded = Cpm::read_model(&path).unwrap();

        let s = SparseVector::from_dense(&[0.0, 1.0]);
        let (a, _) = cpm.predict(&s);
        let (b, _) = reloaded.predict(&s);
        assert!((a - b).abs() < 1e-3, "{a} vs {b}");
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cpm-core-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
