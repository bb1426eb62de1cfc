//! Text and CSV renderings of an evaluation report.

use std::fmt::Write;

use super::{EvaluationReport, LabelReport, Metrics};

const CSV_HEADER: &str = "task,strategy,label,matched,automated_only,human_only,tp,fp,fn,tn,precision,recall,f1,specificity,npv,accuracy,balanced_accuracy,agreement_rate,cohens_kappa,mae,pearson\n";

impl EvaluationReport {
    /// Human-readable report with a confusion table per label.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Task {} ({}), threshold {}, {} episodes with gold labels",
            self.task, self.value_kind, self.options.threshold, self.gold_episodes
        );

        if self.strategies.is_empty() {
            out.push_str("No automated labels\n");
        }
        for (key, strategy) in &self.strategies {
            let _ = writeln!(out, "\n== {} ==", key);
            for (label_name, label) in &strategy.labels {
                let _ = writeln!(out, "\n-- {} --", label_name);
                write_label(&mut out, label);
            }
            out.push_str("\n-- total --\n");
            write_label(&mut out, &strategy.total);
        }

        for (pair, labels) in &self.inter_annotator {
            let _ = writeln!(out, "\n== Agreement {} ==", pair);
            for (label_name, agreement) in labels {
                let _ = writeln!(
                    out,
                    "{:<24} matched {:>5}  kappa {}",
                    label_name,
                    agreement.matched,
                    fmt_metric(match &agreement.metrics {
                        Metrics::Binary(m) => m.cohens_kappa,
                        Metrics::Continuous(m) => m.pearson,
                    })
                );
            }
        }
        out
    }

    /// One row per (strategy, label), plus a `*` row with the strategy totals.
    pub fn to_csv(&self) -> String {
        let mut csv = String::from(CSV_HEADER);
        for (key, strategy) in &self.strategies {
            let rows = strategy
                .labels
                .iter()
                .map(|(name, label)| (name.as_str(), label))
                .chain(std::iter::once(("*", &strategy.total)));
            for (label_name, label) in rows {
                csv.push_str(&csv_row(&self.task, key, label_name, label));
            }
        }
        csv
    }
}

fn write_label(out: &mut String, label: &LabelReport) {
    let _ = writeln!(
        out,
        "matched {}, automated only {}, human only {}",
        label.matched, label.automated_only, label.human_only
    );
    match &label.metrics {
        Metrics::Binary(m) => {
            let c = &m.confusion;
            let _ = writeln!(out, "{:<26}{:^22}", "", "Ground truth labels");
            let _ = writeln!(out, "{:<26}{:>10}{:>12}", "", "Present", "Absent");
            let _ = writeln!(out, "{:<26}{:>10}{:>12}", "Predicted label present", c.tp, c.fp);
            let _ = writeln!(out, "{:<26}{:>10}{:>12}", "Predicted label absent", c.fn_, c.tn);
            for (name, value) in [
                ("Precision", m.precision),
                ("Recall", m.recall),
                ("F1", m.f1),
                ("Specificity", m.specificity),
                ("NPV", m.npv),
                ("Accuracy", m.accuracy),
                ("Balanced accuracy", m.balanced_accuracy),
                ("Agreement", m.agreement_rate),
                ("Cohen's kappa", m.cohens_kappa),
            ] {
                let _ = writeln!(out, "{:<26}{:>10}", name, fmt_metric(value));
            }
        }
        Metrics::Continuous(m) => {
            let _ = writeln!(out, "{:<26}{:>10}", "N", m.n);
            let _ = writeln!(out, "{:<26}{:>10}", "MAE", fmt_metric(m.mae));
            let _ = writeln!(out, "{:<26}{:>10}", "Pearson", fmt_metric(m.pearson));
        }
    }
}

fn csv_row(task: &str, strategy: &str, label_name: &str, label: &LabelReport) -> String {
    let opt = |v: Option<f64>| v.map(|v| format!("{:.5}", v)).unwrap_or_default();
    let mut fields = vec![
        escape_csv(task),
        escape_csv(strategy),
        escape_csv(label_name),
        label.matched.to_string(),
        label.automated_only.to_string(),
        label.human_only.to_string(),
    ];
    match &label.metrics {
        Metrics::Binary(m) => {
            let c = &m.confusion;
            fields.extend([c.tp, c.fp, c.fn_, c.tn].iter().map(u64::to_string));
            fields.extend(
                [
                    m.precision,
                    m.recall,
                    m.f1,
                    m.specificity,
                    m.npv,
                    m.accuracy,
                    m.balanced_accuracy,
                    m.agreement_rate,
                    m.cohens_kappa,
                ]
                .into_iter()
                .map(opt),
            );
            fields.extend([String::new(), String::new()]);
        }
        Metrics::Continuous(m) => {
            fields.extend(std::iter::repeat(String::new()).take(13));
            fields.extend([opt(m.mae), opt(m.pearson)]);
        }
    }
    let mut row = fields.join(",");
    row.push('\n');
    row
}

fn fmt_metric(value: Option<f64>) -> String {
    value.map(|v| format!("{:.3}", v)).unwrap_or_else(|| "n/a".into())
}

/// Escape a string for CSV output.
fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::{binary_metrics, continuous_metrics, EvalOptions, StrategyReport};
    use crate::models::{StrategyId, ValueKind};
    use std::collections::BTreeMap;

    fn report(metrics: Metrics) -> EvaluationReport {
        let label = LabelReport {
            matched: 2,
            automated_only: 1,
            human_only: 0,
            metrics,
        };
        let mut labels = BTreeMap::new();
        labels.insert("fever".to_string(), label.clone());
        let mut strategies = BTreeMap::new();
        strategies.insert(
            "symptom_flags.regex v1".to_string(),
            StrategyReport {
                strategy_id: StrategyId(1),
                name: "regex".into(),
                version: "1".into(),
                labels,
                total: label,
            },
        );
        EvaluationReport {
            task: "symptom_presence".into(),
            value_kind: ValueKind::Binary,
            options: EvalOptions::default(),
            gold_episodes: 2,
            strategies,
            inter_annotator: BTreeMap::new(),
        }
    }

    #[test]
    fn test_text_has_confusion_table() {
        let text = report(Metrics::Binary(binary_metrics(&[(1.0, 1.0), (0.0, 1.0)], 0.5))).to_text();
        assert!(text.contains("Ground truth labels"));
        assert!(text.contains("== symptom_flags.regex v1 =="));
        let present = text.lines().find(|l| l.starts_with("Predicted label present")).unwrap();
        assert_eq!(&present.split_whitespace().collect::<Vec<_>>()[3..], &["1", "0"]);
        let specificity = text.lines().find(|l| l.starts_with("Specificity")).unwrap();
        assert!(specificity.ends_with("n/a"));
    }

    #[test]
    fn test_csv_rows() {
        let csv = report(Metrics::Continuous(continuous_metrics(&[(1.0, 2.0), (2.0, 4.0)]))).to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        let header_fields = lines[0].split(',').count();
        assert!(lines[1..].iter().all(|l| l.split(',').count() == header_fields));
        assert!(lines[2].starts_with("symptom_presence,symptom_flags.regex v1,*,2,1,0"));
        assert!(lines[1].ends_with(",1.50000,1.00000"));
    }

    #[test]
    fn test_escape_csv() {
        assert_eq!(escape_csv("simple"), "simple");
        assert_eq!(escape_csv("a,b"), "\"a,b\"");
        assert_eq!(escape_csv("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
