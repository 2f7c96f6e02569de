//! Held-out evaluation: hinge/exclusion losses, confusion counts, ROC/AUC
//! over the full and truncated false-positive-rate ranges, and the
//! "absolute top" ranking metric.

use cpm_common::{Error, Result};
use cpm_core::{entropy_bits, Cpm};
use cpm_dataset::Dataset;

const MARGIN: f64 = 1.0;

/// All metrics produced by [`measure`] for one test set.
#[derive(Debug, Clone, Copy)]
pub struct Metrics {
    /// Mean per-instance cost, positives and negatives combined.
    pub cost: f64,
    /// Mean hinge loss over positives: `max(0, margin - score)`.
    pub cost_positives: f64,
    /// Mean hinge loss over negatives, summed across all K classifiers:
    /// `sum_k max(0, margin + score[k])`.
    pub cost_negatives: f64,
    /// `W.l2_norm()` at evaluation time.
    pub l2: f64,
    /// Mean exclusion loss over positives.
    pub redundancy: f64,
    /// Assignment entropy over positives, in bits.
    pub entropy_bits: f64,
    /// Fraction of instances classified correctly at threshold 0.
    pub accuracy: f64,
    /// True positive rate at threshold 0.
    pub true_positive_rate: f64,
    /// False positive rate at threshold 0.
    pub false_positive_rate: f64,
    /// Precision at threshold 0.
    pub precision: f64,
    /// True positives, false positives, true negatives, false negatives.
    pub confusion: Confusion,
    /// AUC over the full `[0,1]` FPR range.
    pub auc: f64,
    /// AUC over `[0,0.1]`, rescaled ×10 to `[0,1]`.
    pub auc_01: f64,
    /// AUC over `[0,0.01]`, rescaled ×100 to `[0,1]`.
    pub auc_001: f64,
    /// Fraction of positives ranked strictly above every negative.
    pub absolute_top: f64,
}

/// Confusion counts at a score threshold of 0.
#[derive(Debug, Clone, Copy)]
pub struct Confusion {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

/// Evaluate `model` against `testset`. Mutates `model`'s scratch score
/// buffer via repeated `predict` calls. Fails with [`Error::Inconsistent`]
/// if a predicted sign ever disagrees with the underlying score's sign —
/// a self-check that should never trip on a correctly built model.
pub fn measure(testset: &Dataset, model: &mut Cpm) -> Result<Metrics> {
    let outer_label = model.outer_label();
    let k = model.k() as usize;

    let mut cost_pos = 0.0f64;
    let mut cost_neg = 0.0f64;
    let mut cost_exclusion = 0.0f64;
    let l2 = model.w().l2_norm();

    let mut occ = vec![0u64; k];
    let mut n_pos: u64 = 0;
    let mut n_neg: u64 = 0;
    let mut fps: u64 = 0;
    let mut fns: u64 = 0;

    let mut all_scores: Vec<(bool, f64)> = Vec::with_capacity(testset.len());

    for instance in testset.instances() {
        let (score, index) = model.predict(&instance.x);
        let pred = score > 0.0;
        let scores = model.scores();

        if instance.label == outer_label {
            occ[index as usize] += 1;

            if score < MARGIN {
                cost_pos += MARGIN - score;
            }
            for (i, &s) in scores.iter().enumerate() {
                if i != index as usize {
                    cost_exclusion += s.max(0.0);
                }
            }

            if score < 0.0 {
                fns += 1;
                if pred {
                    return Err(Error::Inconsistent(
                        "negative score but predicted positive (positive instance)".into(),
                    ));
                }
            } else if !pred {
                return Err(Error::Inconsistent(
                    "positive score but predicted negative (positive instance)".into(),
                ));
            }

            all_scores.push((true, score));
            n_pos += 1;
        } else {
            for &s in scores {
                if s > -MARGIN {
                    cost_neg += MARGIN + s;
                }
            }

            if score >= 0.0 {
                fps += 1;
                if !pred {
                    return Err(Error::Inconsistent(
                        "positive score but predicted negative (negative instance)".into(),
                    ));
                }
            } else if pred {
                return Err(Error::Inconsistent(
                    "negative score but predicted positive (negative instance)".into(),
                ));
            }

            all_scores.push((false, score));
            n_neg += 1;
        }
    }

    if n_pos == 0 || n_neg == 0 {
        return Err(Error::InvalidArgument(
            "test set must contain at least one positive and one negative instance".into(),
        ));
    }

    let entropy = entropy_bits(&occ, n_pos);

    cost_exclusion /= n_pos as f64;
    let misc_cost = (cost_neg + cost_pos) / (n_pos + n_neg) as f64;
    cost_pos /= n_pos as f64;
    cost_neg /= n_neg as f64;

    let accuracy = 1.0 - (fps + fns) as f64 / (n_pos + n_neg) as f64;
    let tps = n_pos - fns;
    let tpr = tps as f64 / n_pos as f64;
    let fpr = fps as f64 / n_neg as f64;
    let precision = tps as f64 / (tps + fps) as f64;

    all_scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

    let (auc, auc_01, auc_001, absolute_top) = roc_areas(&all_scores, n_pos, n_neg);

    Ok(Metrics {
        cost: misc_cost,
        cost_positives: cost_pos,
        cost_negatives: cost_neg,
        l2,
        redundancy: cost_exclusion,
        entropy_bits: entropy,
        accuracy,
        true_positive_rate: tpr,
        false_positive_rate: fpr,
        precision,
        confusion: Confusion {
            true_positives: tps as usize,
            false_positives: fps as usize,
            true_negatives: (n_neg - fps) as usize,
            false_negatives: fns as usize,
        },
        auc,
        auc_01,
        auc_001,
        absolute_top,
    })
}

/// Walk the descending-score-sorted list once, collapsing ties, accumulating
/// trapezoidal AUC over `[0,1]`, `[0,0.1]` (×10), `[0,0.01]` (×100), and the
/// "absolute top" count.
fn roc_areas(sorted: &[(bool, f64)], n_pos: u64, n_neg: u64) -> (f64, f64, f64, f64) {
    let mut i = 0usize;
    let mut remaining_pos = n_pos as i64;
    let mut fp = 0i64;
    let mut top_correct = 0u64;

    let mut tprs = fp as f64 / n_neg as f64;
    let mut fprs = 1.0 - remaining_pos as f64 / n_pos as f64;

    let mut area1 = 0.0f64;
    let mut area01 = 0.0f64;
    let mut area001 = 0.0f64;

    while i < sorted.len() {
        let last_tprs = tprs;
        let last_fprs = fprs;

        if sorted[i].0 {
            remaining_pos -= 1;
            if fp == 0 {
                top_correct += 1;
            }
        } else {
            fp += 1;
        }
        i += 1;

        while i < sorted.len() && sorted[i - 1].1 == sorted[i].1 {
            if sorted[i].0 {
                remaining_pos -= 1;
                if fp == 0 {
                    top_correct += 1;
                }
            } else {
                fp += 1;
            }
            i += 1;
        }

        fprs = fp as f64 / n_neg as f64;
        tprs = 1.0 - remaining_pos as f64 / n_pos as f64;

        let darea1 = (fprs - last_fprs) * (last_tprs + tprs) / 2.0;
        area1 += darea1;

        if last_fprs < 0.1 {
            let darea01 = if fprs <= 0.1 {
                (fprs - last_fprs) * (last_tprs + tprs) / 2.0
            } else if fprs > last_fprs {
                let tprs01 = last_tprs + (0.1 - last_fprs) / (fprs - last_fprs) * (tprs - last_tprs);
                (0.1 - last_fprs) * (last_tprs + tprs01) / 2.0
            } else {
                0.0
            };
            area01 += darea01;

            if last_fprs < 0.01 {
                let darea001 = if fprs <= 0.01 {
                    (fprs - last_fprs) * (last_tprs + tprs) / 2.0
                } else if fprs > last_fprs {
                    let tprs001 =
                        last_tprs + (0.01 - last_fprs) / (fprs - last_fprs) * (tprs - last_tprs);
                    (0.01 - last_fprs) * (last_tprs + tprs001) / 2.0
                } else {
                    0.0
                };
                area001 += darea001;
            }
        }
    }

    let absolute_top = top_correct as f64 / n_pos as f64;
    (area1, area01 * 10.0, area001 * 100.0, absolute_top)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auc_and_absolute_top_match_reference_example() {
        // scores: +0.9, +0.1, -0.5, -0.2 -> AUC over [0,1] = 0.75, absolute_top = 0.5
        let sorted = vec![(true, 0.9), (false, -0.2), (true, 0.1), (false, -0.5)];
        let mut sorted = sorted;
        sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let (auc, _, _, absolute_top) = roc_areas(&sorted, 2, 2);
        assert!((auc - 0.75).abs() < 1e-9, "auc = {auc}");
        assert!((absolute_top - 0.5).abs() < 1e-9, "absolute_top = {absolute_top}");
    }
}
