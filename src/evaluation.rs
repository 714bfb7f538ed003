//! Scoring inferred values against ground truth.
//!
//! Truth comes from a fact file in the usual TSV format. Every truth atom with
//! an inferred value is scored; truth atoms inference never produced are
//! counted but not scored.
//!
//! - discrete: accuracy, precision, recall and F1 after thresholding both sides
//! - continuous: mean absolute and mean squared error
//! - ranking: area under the ROC curve and under both precision-recall curves
//! - categorical: per-entity argmax accuracy, when category positions are set

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::database::{Database, Partition, loader};
use crate::error::HlmrfResult;
use crate::model::{Constant, GroundAtom, Model, PredicateId};
use crate::reasoner::invalid_config;

/// `[evaluation]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Values at or above this are true.
    pub threshold: f32,
    /// Argument positions holding the category. Empty skips categorical
    /// accuracy.
    pub category_indexes: Vec<usize>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            category_indexes: Vec::new(),
        }
    }
}

impl EvaluationConfig {
    pub fn validate(&self) -> HlmrfResult<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(invalid_config("evaluation.threshold must be in [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscreteStats {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub negative_precision: f64,
    pub negative_recall: f64,
}

impl DiscreteStats {
    fn from_counts(tp: usize, fp: usize, tn: usize, fn_: usize) -> Self {
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            true_positives: tp,
            false_positives: fp,
            true_negatives: tn,
            false_negatives: fn_,
            accuracy: ratio(tp + tn, tp + fp + tn + fn_),
            precision,
            recall,
            f1,
            negative_precision: ratio(tn, tn + fn_),
            negative_recall: ratio(tn, tn + fp),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuousStats {
    pub mae: f64,
    pub mse: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingStats {
    pub auroc: f64,
    /// Area under the precision-recall curve of the true class.
    pub positive_auprc: f64,
    /// The same for the false class, ranking from the lowest value up.
    pub negative_auprc: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoricalStats {
    pub hits: usize,
    pub misses: usize,
    pub accuracy: f64,
}

/// Every metric for one set of predictions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Truth atoms that had an inferred value.
    pub scored: usize,
    /// Truth atoms with no inferred value.
    pub unmatched: usize,
    pub discrete: DiscreteStats,
    pub continuous: ContinuousStats,
    pub ranking: RankingStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categorical: Option<CategoricalStats>,
}

impl std::fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} scored ({} unmatched): accuracy {:.4}, F1 {:.4}, MAE {:.4}, MSE {:.4}, AUROC {:.4}, AUPRC {:.4}",
            self.scored,
            self.unmatched,
            self.discrete.accuracy,
            self.discrete.f1,
            self.continuous.mae,
            self.continuous.mse,
            self.ranking.auroc,
            self.ranking.positive_auprc,
        )?;
        if let Some(categorical) = &self.categorical {
            write!(f, ", categorical accuracy {:.4}", categorical.accuracy)?;
        }
        Ok(())
    }
}

/// Read a truth file (`Predicate<TAB>args...[<TAB>value]`, value defaulting to 1).
pub fn load_truth(model: &Model, path: &Path) -> HlmrfResult<Vec<(GroundAtom, f32)>> {
    let database = Database::new();
    loader::load_file(&database, model, path, Partition::Read)?;
    let mut truth = database.atoms(Partition::Read);
    truth.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(truth)
}

/// Score `predictions` against `truth`.
pub fn evaluate(
    predictions: &[(GroundAtom, f32)],
    truth: &[(GroundAtom, f32)],
    config: &EvaluationConfig,
) -> HlmrfResult<EvaluationReport> {
    config.validate()?;
    let predicted: HashMap<&GroundAtom, f32> = predictions.iter().map(|(a, v)| (a, *v)).collect();
    // (predicted, truth) in truth order.
    let pairs: Vec<(f32, f32)> = truth
        .iter()
        .filter_map(|(atom, t)| predicted.get(atom).map(|p| (*p, *t)))
        .collect();
    let unmatched = truth.len() - pairs.len();
    if unmatched > 0 {
        tracing::warn!(unmatched, "truth atoms without an inferred value");
    }

    let threshold = config.threshold;
    let report = EvaluationReport {
        scored: pairs.len(),
        unmatched,
        discrete: discrete(&pairs, threshold),
        continuous: continuous(&pairs),
        ranking: RankingStats {
            auroc: auroc(&pairs, threshold),
            positive_auprc: auprc(&pairs, threshold, true),
            negative_auprc: auprc(&pairs, threshold, false),
        },
        categorical: (!config.category_indexes.is_empty())
            .then(|| categorical(predictions, truth, &config.category_indexes)),
    };
    tracing::info!(
        scored = report.scored,
        accuracy = report.discrete.accuracy,
        f1 = report.discrete.f1,
        mae = report.continuous.mae,
        auroc = report.ranking.auroc,
        "evaluation complete"
    );
    Ok(report)
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn discrete(pairs: &[(f32, f32)], threshold: f32) -> DiscreteStats {
    let (mut tp, mut fp, mut tn, mut fn_) = (0, 0, 0, 0);
    for &(p, t) in pairs {
        match (p >= threshold, t >= threshold) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => tn += 1,
        }
    }
    DiscreteStats::from_counts(tp, fp, tn, fn_)
}

fn continuous(pairs: &[(f32, f32)]) -> ContinuousStats {
    if pairs.is_empty() {
        return ContinuousStats::default();
    }
    let n = pairs.len() as f64;
    let (abs, sq) = pairs.iter().fold((0.0, 0.0), |(abs, sq), &(p, t)| {
        let diff = f64::from(p) - f64::from(t);
        (abs + diff.abs(), sq + diff * diff)
    });
    ContinuousStats {
        mae: abs / n,
        mse: sq / n,
    }
}

/// Cumulative (true, false) label counts after each group of equal scores,
/// walking from the highest score down.
fn ranked_counts(pairs: &[(f32, bool)]) -> Vec<(usize, usize)> {
    let mut ranked = pairs.to_vec();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    let mut steps = Vec::new();
    let (mut hits, mut misses) = (0, 0);
    for (i, &(score, label)) in ranked.iter().enumerate() {
        if label {
            hits += 1;
        } else {
            misses += 1;
        }
        if ranked.get(i + 1).is_none_or(|next| next.0 != score) {
            steps.push((hits, misses));
        }
    }
    steps
}

fn auroc(pairs: &[(f32, f32)], threshold: f32) -> f64 {
    let labeled: Vec<(f32, bool)> = pairs.iter().map(|&(p, t)| (p, t >= threshold)).collect();
    let positives = labeled.iter().filter(|(_, l)| *l).count();
    let negatives = labeled.len() - positives;
    if positives == 0 {
        return 0.0;
    }
    if negatives == 0 {
        return 1.0;
    }
    let (mut area, mut prev_tpr, mut prev_fpr) = (0.0, 0.0, 0.0);
    for (tp, fp) in ranked_counts(&labeled) {
        let tpr = tp as f64 / positives as f64;
        let fpr = fp as f64 / negatives as f64;
        area += (fpr - prev_fpr) * (tpr + prev_tpr) / 2.0;
        prev_tpr = tpr;
        prev_fpr = fpr;
    }
    area
}

fn auprc(pairs: &[(f32, f32)], threshold: f32, positive: bool) -> f64 {
    // The false class is ranked by how low its value is.
    let labeled: Vec<(f32, bool)> = pairs
        .iter()
        .map(|&(p, t)| {
            let label = t >= threshold;
            if positive { (p, label) } else { (-p, !label) }
        })
        .collect();
    let relevant = labeled.iter().filter(|(_, l)| *l).count();
    if relevant == 0 {
        return 0.0;
    }
    let (mut area, mut prev_precision, mut prev_recall) = (0.0, 1.0, 0.0);
    for (tp, fp) in ranked_counts(&labeled) {
        let precision = ratio(tp, tp + fp);
        let recall = tp as f64 / relevant as f64;
        area += (recall - prev_recall) * (precision + prev_precision) / 2.0;
        prev_precision = precision;
        prev_recall = recall;
    }
    area
}

/// The entity an atom describes: its predicate and non-category arguments.
type EntityKey = (PredicateId, Vec<Constant>);

fn entity(atom: &GroundAtom, category_indexes: &[usize]) -> Option<EntityKey> {
    if category_indexes.iter().any(|&i| i >= atom.args.len()) {
        return None;
    }
    let rest = atom
        .args
        .iter()
        .enumerate()
        .filter(|(i, _)| !category_indexes.contains(i))
        .map(|(_, c)| c.clone())
        .collect();
    Some((atom.predicate, rest))
}

/// Each entity's predicted category is its highest-valued atom; a truth atom
/// at 1 is a hit when it is that atom.
fn categorical(
    predictions: &[(GroundAtom, f32)],
    truth: &[(GroundAtom, f32)],
    category_indexes: &[usize],
) -> CategoricalStats {
    let mut best: BTreeMap<EntityKey, (&GroundAtom, f32)> = BTreeMap::new();
    for (atom, value) in predictions {
        let Some(key) = entity(atom, category_indexes) else {
            continue;
        };
        if best.get(&key).is_none_or(|(_, current)| *value > *current) {
            best.insert(key, (atom, *value));
        }
    }

    let (mut hits, mut misses) = (0, 0);
    for (atom, value) in truth {
        if *value < 1.0 {
            continue;
        }
        let Some(key) = entity(atom, category_indexes) else {
            continue;
        };
        match best.get(&key) {
            Some((predicted, _)) if *predicted == atom => hits += 1,
            _ => misses += 1,
        }
    }
    CategoricalStats {
        hits,
        misses,
        accuracy: ratio(hits, hits + misses),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(predicate: usize, args: &[&str]) -> GroundAtom {
        GroundAtom::new(
            PredicateId::from_index(predicate),
            args.iter().map(|a| (*a).into()).collect(),
        )
    }

    /// a: 0.9 vs 1, b: 0.8 vs 0, c: 0.3 vs 1, d: 0.1 vs 0.
    fn scored() -> (Vec<(GroundAtom, f32)>, Vec<(GroundAtom, f32)>) {
        let cases = [("a", 0.9, 1.0), ("b", 0.8, 0.0), ("c", 0.3, 1.0), ("d", 0.1, 0.0)];
        let predictions = cases.iter().map(|(n, p, _)| (atom(0, &[n]), *p)).collect();
        let truth = cases.iter().map(|(n, _, t)| (atom(0, &[n]), *t)).collect();
        (predictions, truth)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn discrete_counts_and_rates() {
        let (predictions, truth) = scored();
        let report = evaluate(&predictions, &truth, &EvaluationConfig::default()).unwrap();
        let d = &report.discrete;
        assert_eq!(
            (d.true_positives, d.false_positives, d.true_negatives, d.false_negatives),
            (1, 1, 1, 1)
        );
        assert!(close(d.accuracy, 0.5));
        assert!(close(d.precision, 0.5));
        assert!(close(d.recall, 0.5));
        assert!(close(d.f1, 0.5));

        // Lowering the threshold makes c a true positive and b stays a false one.
        let config = EvaluationConfig {
            threshold: 0.25,
            ..EvaluationConfig::default()
        };
        let d = evaluate(&predictions, &truth, &config).unwrap().discrete;
        assert!(close(d.recall, 1.0));
        assert!(close(d.precision, 2.0 / 3.0));
        assert!(close(d.f1, 0.8));
    }

    #[test]
    fn continuous_errors() {
        let (predictions, truth) = scored();
        let c = evaluate(&predictions, &truth, &EvaluationConfig::default())
            .unwrap()
            .continuous;
        // |errors| = 0.1, 0.8, 0.7, 0.1
        assert!(close(c.mae, 0.425), "{}", c.mae);
        assert!(close(c.mse, 0.2875), "{}", c.mse);
    }

    #[test]
    fn ranking_areas() {
        let (predictions, truth) = scored();
        let r = evaluate(&predictions, &truth, &EvaluationConfig::default())
            .unwrap()
            .ranking;
        // Three of the four positive/negative pairs are ordered correctly.
        assert!(close(r.auroc, 0.75), "{}", r.auroc);
        // Recall 0.5 at precision 1, then recall 1 at precision 2/3.
        let expected = 0.5 + 0.5 * (0.5 + 2.0 / 3.0) / 2.0;
        assert!(close(r.positive_auprc, expected), "{}", r.positive_auprc);
        assert!(close(r.negative_auprc, expected), "{}", r.negative_auprc);
    }

    #[test]
    fn perfect_ranking_and_degenerate_classes() {
        let predictions = vec![(atom(0, &["a"]), 0.7), (atom(0, &["b"]), 0.2)];
        let truth = vec![(atom(0, &["a"]), 1.0), (atom(0, &["b"]), 0.0)];
        let r = evaluate(&predictions, &truth, &EvaluationConfig::default())
            .unwrap()
            .ranking;
        assert!(close(r.auroc, 1.0));
        assert!(close(r.positive_auprc, 1.0));

        let all_true = vec![(atom(0, &["a"]), 1.0), (atom(0, &["b"]), 1.0)];
        let r = evaluate(&predictions, &all_true, &EvaluationConfig::default())
            .unwrap()
            .ranking;
        assert_eq!(r.auroc, 1.0);
        assert_eq!(r.negative_auprc, 0.0);
    }

    #[test]
    fn tied_scores_count_as_one_step() {
        let predictions = vec![(atom(0, &["a"]), 0.5), (atom(0, &["b"]), 0.5)];
        let truth = vec![(atom(0, &["a"]), 1.0), (atom(0, &["b"]), 0.0)];
        let r = evaluate(&predictions, &truth, &EvaluationConfig::default())
            .unwrap()
            .ranking;
        assert!(close(r.auroc, 0.5));
    }

    #[test]
    fn categorical_accuracy_uses_argmax_per_entity() {
        let predictions = vec![
            (atom(1, &["ann", "red"]), 0.7),
            (atom(1, &["ann", "blue"]), 0.3),
            (atom(1, &["bob", "red"]), 0.4),
            (atom(1, &["bob", "blue"]), 0.6),
        ];
        let truth = vec![
            (atom(1, &["ann", "red"]), 1.0),
            (atom(1, &["ann", "blue"]), 0.0),
            (atom(1, &["bob", "red"]), 1.0),
            (atom(1, &["bob", "blue"]), 0.0),
        ];
        let config = EvaluationConfig {
            category_indexes: vec![1],
            ..EvaluationConfig::default()
        };
        let report = evaluate(&predictions, &truth, &config).unwrap();
        let c = report.categorical.unwrap();
        assert_eq!((c.hits, c.misses), (1, 1));
        assert!(close(c.accuracy, 0.5));
        assert!(
            evaluate(&predictions, &truth, &EvaluationConfig::default())
                .unwrap()
                .categorical
                .is_none()
        );
    }

    #[test]
    fn unmatched_truth_is_counted_not_scored() {
        let (predictions, mut truth) = scored();
        truth.push((atom(0, &["e"]), 1.0));
        let report = evaluate(&predictions, &truth, &EvaluationConfig::default()).unwrap();
        assert_eq!(report.scored, 4);
        assert_eq!(report.unmatched, 1);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"auroc\""));
        assert!(!json.contains("categorical"));
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let config = EvaluationConfig {
            threshold: 1.5,
            ..EvaluationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn truth_file_loads_with_default_value() {
        let mut model = Model::new();
        model.add_predicate("Label", 2, false).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("truth.tsv");
        std::fs::write(&path, "Label\tann\tred\nLabel\tann\tblue\t0\n").unwrap();
        let truth = load_truth(&model, &path).unwrap();
        assert_eq!(truth.len(), 2);
        let red = model.atom("Label", &["ann", "red"]).unwrap();
        assert!(truth.contains(&(red, 1.0)));
    }
}
