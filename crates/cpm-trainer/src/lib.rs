//! Epoch accounting, permutation/reshuffle, and user-facing parameter
//! conversion around the bare [`cpm_core::Cpm`] engine.

use cpm_common::{Error, Result};
use cpm_core::Cpm;
use cpm_dataset::Dataset;
use cpm_sparse::SparseVector;
use rand::seq::SliceRandom;
use rand_mt::Mt19937GenRand32;
use std::path::Path;

/// Metrics reported at each epoch boundary (once both class counters have
/// each reached their dataset totals).
#[derive(Debug, Clone, Copy)]
pub struct EpochReport {
    /// 0-based epoch index.
    pub epoch: u64,
    /// Fraction of positives whose attribution changed this epoch.
    pub reassignment_rate: f64,
    /// Mean exclusion loss over positives seen this epoch.
    pub mean_exclusion_loss: f64,
    /// Assignment entropy, in bits, over all positives.
    pub entropy_bits: f64,
    /// Mean hinge loss over negatives seen this epoch.
    pub mean_neg_hinge_loss: f64,
    /// Mean hinge loss over positives seen this epoch.
    pub mean_pos_hinge_loss: f64,
}

/// User-facing wrapper: converts `(C, cost_ratio)` into the engine's
/// `(lambda, negative_cost, positive_cost)` and drives the training loop.
pub struct Trainer {
    outer_label: i64,
    k: u16,
    /// Global L2 budget; the per-step `lambda` is this divided by the
    /// iteration count at `fit` time.
    lambda: f64,
    entropy: f64,
    cost_ratio: f64,
    seed: u64,
    model: Option<Cpm>,
}

impl Trainer {
    /// `lambda` is the *global* L2 budget (`1/C`); `cost_ratio` is
    /// `negative_cost/positive_cost`.
    pub fn new(outer_label: i64, k: u16, lambda: f64, entropy: f64, cost_ratio: f64, seed: u64) -> Self {
        Self {
            outer_label,
            k,
            lambda,
            entropy,
            cost_ratio,
            seed,
            model: None,
        }
    }

    /// Train for `iterations` total SGD steps over `dataset`. Replaces any
    /// previously fitted model. Returns one [`EpochReport`] per epoch
    /// boundary crossed. An empty dataset is reported via `Ok(vec![])`
    /// without mutating state, matching upstream's "empty training set"
    /// no-op.
    pub fn fit(&mut self, dataset: &Dataset, iterations: u64, reshuffle: bool) -> Result<Vec<EpochReport>> {
        let n_instances = dataset.len();
        if n_instances < 1 {
            tracing::warn!("empty training set, skipping fit");
            return Ok(Vec::new());
        }

        let n_positives = dataset.count_for_label(self.outer_label);
        let n_negatives = n_instances - n_positives;

        let per_step_lambda = self.lambda / iterations as f64;
        let negative_cost = self.cost_ratio / (1.0 + self.cost_ratio);
        let positive_cost = 1.0 / (1.0 + self.cost_ratio);

        tracing::info!(
            dimensions = dataset.dimensions(),
            classifiers = self.k,
            lambda = per_step_lambda,
            iterations,
            cost_ratio = self.cost_ratio,
            entropy = self.entropy,
            negatives = n_negatives,
            positives = n_positives,
            "starting fit"
        );

        let mut cpm = Cpm::new(
            self.outer_label,
            dataset.dimensions(),
            self.k,
            per_step_lambda,
            self.entropy,
            negative_cost,
            positive_cost,
            n_positives,
            self.seed,
        )?;

        let mut rng = Mt19937GenRand32::new(self.seed as u32);
        let mut perm: Vec<usize> = (0..n_instances).collect();
        perm.shuffle(&mut rng);

        let mut seen_positives = 0u64;
        let mut seen_negatives = 0u64;
        let mut pos_loss = 0.0f64;
        let mut neg_loss = 0.0f64;
        let mut redundancy = 0.0f64;
        let mut reassignments = 0u64;
        let mut epoch = 0u64;
        let mut reports = Vec::new();

        for iter in 0..iterations {
            let instance = dataset.instance(perm[iter as usize % n_instances]);
            let is_positive = instance.label == self.outer_label;
            let previous_assignment = if is_positive {
                cpm.assignments()[instance.pos_id]
            } else {
                -1
            };

            let (score, eloss, assignment) = cpm.one_step(instance)?;

            if is_positive {
                pos_loss += (1.0 - score).max(0.0);
                redundancy += eloss;
                if previous_assignment != assignment as i32 {
                    reassignments += 1;
                }
                seen_positives += 1;
            } else {
                neg_loss += (1.0 + score).max(0.0);
                seen_negatives += 1;
            }

            if seen_negatives >= n_negatives as u64 && seen_positives >= n_positives as u64 {
                let rate = reassignments as f64 / n_positives as f64;
                let entropy_bits = entropy_bits_from_assignments(cpm.assignments(), self.k);

                let report = EpochReport {
                    epoch,
                    reassignment_rate: rate,
                    mean_exclusion_loss: redundancy / n_positives as f64,
                    entropy_bits,
                    mean_neg_hinge_loss: neg_loss / seen_negatives as f64,
                    mean_pos_hinge_loss: pos_loss / n_positives as f64,
                };
                tracing::info!(
                    epoch,
                    reassignment_rate = report.reassignment_rate,
                    mean_exclusion_loss = report.mean_exclusion_loss,
                    entropy_bits = report.entropy_bits,
                    mean_neg_hinge_loss = report.mean_neg_hinge_loss,
                    mean_pos_hinge_loss = report.mean_pos_hinge_loss,
                    "epoch boundary"
                );
                reports.push(report);

                seen_positives = 0;
                seen_negatives = 0;
                neg_loss = 0.0;
                pos_loss = 0.0;
                redundancy = 0.0;
                epoch += 1;

                if reshuffle {
                    perm.shuffle(&mut rng);
                }
            }
        }

        self.model = Some(cpm);
        Ok(reports)
    }

    /// Predict `(score, assigned classifier)` for a single feature vector.
    pub fn predict(&mut self, s: &SparseVector) -> Result<(f64, u16)> {
        let model = self.model.as_mut().ok_or_else(|| {
            Error::InvalidArgument("no model fitted or loaded yet".into())
        })?;
        Ok(model.predict(s))
    }

    /// Predict over an entire dataset, returning parallel `(scores,
    /// assignments)` vectors in dataset order.
    pub fn predict_dataset(&mut self, testset: &Dataset) -> Result<(Vec<f32>, Vec<i32>)> {
        let model = self.model.as_mut().ok_or_else(|| {
            Error::InvalidArgument("no model fitted or loaded yet".into())
        })?;

        let mut scores = Vec::with_capacity(testset.len());
        let mut assignments = Vec::with_capacity(testset.len());
        for instance in testset.instances() {
            let (score, assignment) = model.predict(&instance.x);
            scores.push(score as f32);
            assignments.push(i32::from(assignment));
        }
        Ok((scores, assignments))
    }

    /// The fitted/loaded engine, if any.
    pub fn model(&self) -> Option<&Cpm> {
        self.model.as_ref()
    }

    /// Write the current model to disk.
    pub fn write_model(&self, path: impl AsRef<Path>) -> Result<()> {
        let model = self.model.as_ref().ok_or_else(|| {
            Error::InvalidArgument("no model fitted or loaded yet".into())
        })?;
        model.write_model(path)
    }

    /// Load a model from disk, replacing any fitted state. The trainer's
    /// own parameter fields are refreshed from the loaded model so a
    /// subsequent `fit` call (e.g. continuing training) sees consistent
    /// values.
    pub fn read_model(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let model = Cpm::read_model(path)?;
        self.outer_label = model_outer_label(&model);
        self.k = model.k();
        self.model = Some(model);
        Ok(())
    }
}

fn model_outer_label(model: &Cpm) -> i64 {
    // Cpm doesn't expose outer_label directly beyond what it needs
    // internally for one_step; reading it back out just threads through
    // the value that was passed to Cpm::new by read_model.
    model.outer_label()
}

fn entropy_bits_from_assignments(assignments: &[i32], k: u16) -> f64 {
    let mut counts = vec![0u64; k as usize];
    let mut total = 0u64;
    for &a in assignments {
        if a >= 0 && (a as usize) < counts.len() {
            counts[a as usize] += 1;
            total += 1;
        }
    }
    cpm_core::entropy_bits(&counts, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpm_dataset::Dataset;
    use std::io::Write;

    fn toy_dataset() -> Dataset {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "1 1:1.0").unwrap();
        writeln!(f, "-1 1:-1.0").unwrap();
        f.flush().unwrap();
        Dataset::from_libsvm_file(f.path(), 16).unwrap()
    }

    #[test]
    fn fit_produces_epoch_reports_and_a_usable_model() {
        let ds = toy_dataset();
        let mut trainer = Trainer::new(1, 1, 0.1 * 100.0, 0.0, 1.0, 0);
        let reports = trainer.fit(&ds, 100, false).unwrap();
        assert!(!reports.is_empty());

        let (score_pos, _) = trainer.predict(&SparseVector::from_dense(&[0.0, 1.0])).unwrap();
        let (score_neg, _) = trainer.predict(&SparseVector::from_dense(&[0.0, -1.0])).unwrap();
        assert!(score_pos > score_neg);
    }

    #[test]
    fn predict_without_fit_fails() {
        let mut trainer = Trainer::new(1, 1, 1.0, 0.0, 1.0, 0);
        let err = trainer.predict(&SparseVector::from_dense(&[1.0])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn empty_dataset_is_a_no_op() {
        let empty = Dataset::from_dense(&[], &[], 0);
        // from_dense rejects empty labels, so build an empty set via libsvm instead.
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.flush().unwrap();
        let ds = Dataset::from_libsvm_file(f.path(), 1).unwrap();
        assert!(empty.is_err());
        assert!(ds.is_empty());

        let mut trainer = Trainer::new(1, 1, 1.0, 0.0, 1.0, 0);
        let reports = trainer.fit(&ds, 10, false).unwrap();
        assert!(reports.is_empty());
        assert!(trainer.model().is_none());
    }
}
