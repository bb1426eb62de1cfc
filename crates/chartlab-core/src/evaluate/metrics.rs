//! Agreement metrics over (predicted, truth) value pairs.
//!
//! Undefined ratios (zero denominators) are `None`, never NaN, so reports serialize
//! the same way every time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 2x2 confusion matrix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub tp: u64,
    pub fp: u64,
    #[serde(rename = "fn")]
    pub fn_: u64,
    pub tn: u64,
}

impl ConfusionCounts {
    /// Binarize pairs at `threshold`: values at or above it are positive.
    pub fn from_pairs(pairs: &[(f64, f64)], threshold: f64) -> Self {
        let mut counts = Self::default();
        for &(predicted, truth) in pairs {
            match (predicted >= threshold, truth >= threshold) {
                (true, true) => counts.tp += 1,
                (true, false) => counts.fp += 1,
                (false, true) => counts.fn_ += 1,
                (false, false) => counts.tn += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> u64 {
        self.tp + self.fp + self.fn_ + self.tn
    }

    pub fn precision(&self) -> Option<f64> {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> Option<f64> {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn specificity(&self) -> Option<f64> {
        ratio(self.tn, self.tn + self.fp)
    }

    pub fn npv(&self) -> Option<f64> {
        ratio(self.tn, self.tn + self.fn_)
    }

    pub fn accuracy(&self) -> Option<f64> {
        ratio(self.tp + self.tn, self.total())
    }

    pub fn f1(&self) -> Option<f64> {
        ratio(2 * self.tp, 2 * self.tp + self.fp + self.fn_)
    }

    /// Mean of recall and specificity, or whichever is defined.
    pub fn balanced_accuracy(&self) -> Option<f64> {
        match (self.recall(), self.specificity()) {
            (Some(r), Some(s)) => Some((r + s) / 2.0),
            (r, s) => r.or(s),
        }
    }

    pub fn cohens_kappa(&self) -> Option<f64> {
        let n = self.total() as f64;
        if n == 0.0 {
            return None;
        }
        let observed = (self.tp + self.tn) as f64 / n;
        let expected = ((self.tp + self.fp) as f64 * (self.tp + self.fn_) as f64
            + (self.fn_ + self.tn) as f64 * (self.fp + self.tn) as f64)
            / (n * n);
        kappa(observed, expected)
    }
}

/// Metrics for binary and ordinal labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryMetrics {
    pub confusion: ConfusionCounts,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
    pub specificity: Option<f64>,
    pub npv: Option<f64>,
    pub accuracy: Option<f64>,
    pub balanced_accuracy: Option<f64>,
    /// Share of pairs with identical values
    pub agreement_rate: Option<f64>,
    pub cohens_kappa: Option<f64>,
}

/// Metrics for continuous labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousMetrics {
    pub n: u64,
    pub mae: Option<f64>,
    pub pearson: Option<f64>,
}

/// Metric family chosen by the task's value kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Metrics {
    Binary(BinaryMetrics),
    Continuous(ContinuousMetrics),
}

impl Metrics {
    pub fn confusion(&self) -> Option<&ConfusionCounts> {
        match self {
            Metrics::Binary(m) => Some(&m.confusion),
            Metrics::Continuous(_) => None,
        }
    }
}

impl BinaryMetrics {
    pub fn from_counts(confusion: ConfusionCounts) -> Self {
        Self {
            precision: confusion.precision(),
            recall: confusion.recall(),
            f1: confusion.f1(),
            specificity: confusion.specificity(),
            npv: confusion.npv(),
            accuracy: confusion.accuracy(),
            balanced_accuracy: confusion.balanced_accuracy(),
            agreement_rate: confusion.accuracy(),
            cohens_kappa: confusion.cohens_kappa(),
            confusion,
        }
    }
}

/// Binary labels: everything from the thresholded confusion matrix.
pub fn binary_metrics(pairs: &[(f64, f64)], threshold: f64) -> BinaryMetrics {
    BinaryMetrics::from_counts(ConfusionCounts::from_pairs(pairs, threshold))
}

/// Ordinal labels: confusion metrics at the threshold, with agreement and kappa over
/// the exact levels.
pub fn ordinal_metrics(pairs: &[(f64, f64)], threshold: f64) -> BinaryMetrics {
    let levels: Vec<(i64, i64)> = pairs.iter().map(|&(p, t)| (level(p), level(t))).collect();
    let agreement = levels.iter().filter(|(p, t)| p == t).count() as u64;

    BinaryMetrics {
        agreement_rate: ratio(agreement, levels.len() as u64),
        cohens_kappa: categorical_kappa(&levels),
        ..binary_metrics(pairs, threshold)
    }
}

/// Continuous labels: mean absolute error and Pearson correlation.
pub fn continuous_metrics(pairs: &[(f64, f64)]) -> ContinuousMetrics {
    let n = pairs.len();
    if n == 0 {
        return ContinuousMetrics {
            n: 0,
            mae: None,
            pearson: None,
        };
    }
    let nf = n as f64;
    let mae = pairs.iter().map(|(p, t)| (p - t).abs()).sum::<f64>() / nf;

    let mean_p = pairs.iter().map(|(p, _)| p).sum::<f64>() / nf;
    let mean_t = pairs.iter().map(|(_, t)| t).sum::<f64>() / nf;
    let (mut cov, mut var_p, mut var_t) = (0.0, 0.0, 0.0);
    for (p, t) in pairs {
        cov += (p - mean_p) * (t - mean_t);
        var_p += (p - mean_p).powi(2);
        var_t += (t - mean_t).powi(2);
    }
    let pearson = (n >= 2 && var_p > 0.0 && var_t > 0.0).then(|| cov / (var_p.sqrt() * var_t.sqrt()));

    ContinuousMetrics {
        n: n as u64,
        mae: Some(mae),
        pearson,
    }
}

/// Unweighted Cohen's kappa over categorical (predicted, truth) pairs.
pub fn categorical_kappa<K: Ord + Copy>(pairs: &[(K, K)]) -> Option<f64> {
    if pairs.is_empty() {
        return None;
    }
    let n = pairs.len() as f64;
    let mut predicted: BTreeMap<K, f64> = BTreeMap::new();
    let mut truth: BTreeMap<K, f64> = BTreeMap::new();
    let mut agree = 0.0;
    for &(p, t) in pairs {
        *predicted.entry(p).or_default() += 1.0;
        *truth.entry(t).or_default() += 1.0;
        if p == t {
            agree += 1.0;
        }
    }
    let expected = predicted
        .iter()
        .map(|(k, count)| count * truth.get(k).copied().unwrap_or(0.0))
        .sum::<f64>()
        / (n * n);
    kappa(agree / n, expected)
}

fn kappa(observed: f64, expected: f64) -> Option<f64> {
    // Undefined when chance agreement is total
    (expected < 1.0).then(|| (observed - expected) / (1.0 - expected))
}

fn level(value: f64) -> i64 {
    (value * 1e5).round() as i64
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Option<f64>, b: f64) -> bool {
        a.map_or(false, |a| (a - b).abs() < 1e-9)
    }

    #[test]
    fn test_confusion_metrics() {
        // tp 3, fp 1, fn 2, tn 4
        let mut pairs = vec![(1.0, 1.0); 3];
        pairs.push((1.0, 0.0));
        pairs.extend(vec![(0.0, 1.0); 2]);
        pairs.extend(vec![(0.0, 0.0); 4]);
        let m = binary_metrics(&pairs, 0.5);

        assert_eq!(m.confusion, ConfusionCounts { tp: 3, fp: 1, fn_: 2, tn: 4 });
        assert!(close(m.precision, 0.75));
        assert!(close(m.recall, 0.6));
        assert!(close(m.f1, 6.0 / 9.0));
        assert!(close(m.specificity, 0.8));
        assert!(close(m.npv, 4.0 / 6.0));
        assert!(close(m.accuracy, 0.7));
        assert!(close(m.balanced_accuracy, 0.7));
        // po 0.7, pe (4*5 + 6*5) / 100 = 0.5
        assert!(close(m.cohens_kappa, 0.4));
    }

    #[test]
    fn test_undefined_ratios_are_none() {
        let m = binary_metrics(&[(1.0, 1.0)], 0.5);
        assert!(close(m.precision, 1.0));
        assert_eq!(m.specificity, None);
        assert_eq!(m.npv, None);
        assert!(close(m.balanced_accuracy, 1.0));
        assert_eq!(m.cohens_kappa, None);

        let empty = binary_metrics(&[], 0.5);
        assert_eq!(empty.accuracy, None);
        assert_eq!(empty.f1, None);
    }

    #[test]
    fn test_ordinal_exact_agreement() {
        let pairs = [(2.0, 2.0), (1.0, 2.0), (0.0, 0.0), (2.0, 1.0)];
        let m = ordinal_metrics(&pairs, 0.5);

        // All non-zero levels are positive at the threshold
        assert_eq!(m.confusion.tp, 3);
        assert!(close(m.accuracy, 1.0));
        assert!(close(m.agreement_rate, 0.5));
        // po 0.5, pe (1*1 + 1*1 + 2*2) / 16
        assert!(close(m.cohens_kappa, (0.5 - 6.0 / 16.0) / (1.0 - 6.0 / 16.0)));
    }

    #[test]
    fn test_continuous() {
        let m = continuous_metrics(&[(1.0, 2.0), (2.0, 4.0), (3.0, 6.0)]);
        assert_eq!(m.n, 3);
        assert!(close(m.mae, 2.0));
        assert!(close(m.pearson, 1.0));

        let flat = continuous_metrics(&[(1.0, 2.0), (1.0, 3.0)]);
        assert_eq!(flat.pearson, None);
        assert_eq!(continuous_metrics(&[]).mae, None);
    }

    #[test]
    fn test_serialized_field_names() {
        let json = serde_json::to_string(&ConfusionCounts { tp: 1, fp: 0, fn_: 0, tn: 0 }).unwrap();
        assert_eq!(json, r#"{"tp":1,"fp":0,"fn":0,"tn":0}"#);
    }
}
