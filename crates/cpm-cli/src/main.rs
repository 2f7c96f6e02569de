//! Train and/or evaluate a convex polytope machine from the command line.
//!
//! Mirrors the original tool's flag set: train if `--train` is given,
//! otherwise load `--model_in`; then, if a test set is given, score it.

use clap::Parser;
use cpm_common::Result;
use cpm_dataset::Dataset;
use cpm_trainer::Trainer;
use serde::Deserialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

/// Train and evaluate a convex polytope machine.
#[derive(Parser, Debug)]
#[command(name = "cpm", version, about = "Train and evaluate a convex polytope machine")]
struct Args {
    /// Path to a training set in libsvm format. If empty, no training is
    /// performed and `--model_in` is loaded instead.
    #[arg(short = 't', long = "train", default_value = "")]
    train: String,

    /// Path to a test set in libsvm format to score after training/loading.
    #[arg(short = 'c', long = "test", default_value = "")]
    test: String,

    /// Path to load a previously trained model from, if `--train` is empty.
    #[arg(short = 'm', long = "model_in", default_value = "")]
    model_in: String,

    /// Path to write the trained model to.
    #[arg(short = 'o', long = "model_out", default_value = "")]
    model_out: String,

    /// Path to write per-instance test scores to. Required if both a model
    /// and a test set are in play.
    #[arg(short = 's', long = "scores", default_value = "")]
    scores: String,

    /// Optional TOML config file. Command-line flags override it; it
    /// overrides built-in defaults.
    #[arg(long = "config", default_value = "")]
    config: String,

    /// Number of half-space classifiers in the polytope.
    #[arg(short = 'k', long = "classifiers", default_value_t = 1)]
    classifiers: u16,

    /// Inverse regularization strength.
    #[arg(short = 'C', long = "C", default_value_t = 1.0)]
    c: f64,

    /// Ratio of negative to positive misclassification cost.
    #[arg(long = "cost_ratio", default_value_t = 1.0)]
    cost_ratio: f64,

    /// Minimum exp of entropy enforced over the positive assignment
    /// distribution.
    #[arg(long = "entropy", default_value_t = 1.0)]
    entropy: f64,

    /// Random seed. Defaults to the current time folded to 32 bits.
    #[arg(long = "seed", default_value_t = default_seed())]
    seed: u64,

    /// Label value treated as the positive ("outer") class.
    #[arg(long = "outer_label", default_value_t = 1)]
    outer_label: i64,

    /// Reshuffle the training order every epoch.
    #[arg(long = "reshuffle", default_value_t = false)]
    reshuffle: bool,

    /// Number of SGD iterations.
    #[arg(short = 'i', long = "iterations", default_value_t = 50_000_000)]
    iterations: u64,

    /// Suppress progress logging.
    #[arg(long = "quiet", default_value_t = false)]
    quiet: bool,
}

fn default_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    (nanos ^ (nanos >> 32)) & 0xFFFF_FFFF
}

/// Overrides loadable from `cpm.toml`. Every field is optional so a partial
/// file only overrides what it names; unknown keys are ignored by serde.
#[derive(Deserialize, Default, Debug)]
#[serde(default)]
struct FileConfig {
    classifiers: Option<u16>,
    c: Option<f64>,
    cost_ratio: Option<f64>,
    entropy: Option<f64>,
    seed: Option<u64>,
    outer_label: Option<i64>,
    reshuffle: Option<bool>,
    iterations: Option<u64>,
}

fn load_config(path: &str) -> Result<FileConfig> {
    if path.is_empty() {
        return Ok(FileConfig::default());
    }
    let text = fs::read_to_string(path).map_err(|e| cpm_common::Error::io(path, e))?;
    toml::from_str(&text).map_err(|e| cpm_common::Error::malformed(path, e.to_string()))
}

fn init_logging(quiet: bool) {
    let default_level = if quiet { "error" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn run(args: Args) -> Result<()> {
    let file_config = load_config(&args.config)?;

    let classifiers = file_config.classifiers.unwrap_or(args.classifiers);
    let c = file_config.c.unwrap_or(args.c);
    let cost_ratio = file_config.cost_ratio.unwrap_or(args.cost_ratio);
    let entropy = file_config.entropy.unwrap_or(args.entropy);
    let seed = file_config.seed.unwrap_or(args.seed);
    let outer_label = file_config.outer_label.unwrap_or(args.outer_label);
    let reshuffle = file_config.reshuffle.unwrap_or(args.reshuffle);
    let iterations = file_config.iterations.unwrap_or(args.iterations);

    let lambda = 1.0 / c;
    let mut trainer = Trainer::new(outer_label, classifiers, lambda, entropy, cost_ratio, seed);

    if !args.train.is_empty() {
        let trainset = Dataset::from_libsvm_file(Path::new(&args.train), 1 << 20)?;
        let reports = trainer.fit(&trainset, iterations, reshuffle)?;
        for report in &reports {
            tracing::info!(
                target: "trainer.epoch",
                epoch = report.epoch,
                reassignment_rate = report.reassignment_rate,
                exclusion_loss = report.mean_exclusion_loss,
                entropy_bits = report.entropy_bits,
                neg_hinge_loss = report.mean_neg_hinge_loss,
                pos_hinge_loss = report.mean_pos_hinge_loss,
                "epoch complete"
            );
        }
        if !args.model_out.is_empty() {
            trainer.write_model(Path::new(&args.model_out))?;
        }
    } else if !args.model_in.is_empty() {
        trainer.read_model(Path::new(&args.model_in))?;
    }

    if trainer.model().is_some() && !args.test.is_empty() {
        if args.scores.is_empty() {
            return Err(cpm_common::Error::InvalidArgument(
                "--scores is required when scoring a test set".into(),
            ));
        }
        let testset = Dataset::from_libsvm_file(Path::new(&args.test), 1 << 20)?;
        let (scores, assignments) = trainer.predict_dataset(&testset)?;

        let mut out = fs::File::create(&args.scores)
            .map_err(|e| cpm_common::Error::io(&args.scores, e))?;
        for (i, instance) in testset.instances().iter().enumerate() {
            let is_outer = if instance.label == outer_label { 1 } else { 0 };
            writeln!(out, "{}\t{}\t{}", scores[i], assignments[i], is_outer)
                .map_err(|e| cpm_common::Error::io(&args.scores, e))?;
        }
    }

    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.quiet);

    if let Err(e) = run(args) {
        tracing::error!("{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_path_yields_all_defaults() {
        let config = load_config("").unwrap();
        assert!(config.classifiers.is_none());
        assert!(config.seed.is_none());
    }

    #[test]
    fn config_file_overrides_only_named_fields() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "classifiers = 4\ncost_ratio = 2.5").unwrap();
        f.flush().unwrap();
        let config = load_config(f.path().to_str().unwrap()).unwrap();
        assert_eq!(config.classifiers, Some(4));
        assert_eq!(config.cost_ratio, Some(2.5));
        assert!(config.entropy.is_none());
    }

    #[test]
    fn default_seed_is_stable_within_a_call() {
        let a = default_seed();
        assert!(a <= 0xFFFF_FFFF);
    }
}
