use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::Label;
use crate::tfidf::SparseVector;

/// Multinomial naive Bayes over the fixed classes {ham, spam}, updatable one
/// batch at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultinomialNb {
    alpha: f64,
    class_count: [f64; 2],
    feature_count: [Vec<f64>; 2],
}

impl MultinomialNb {
    pub fn new(n_features: usize) -> Self {
        Self {
            alpha: 1.0,
            class_count: [0.0; 2],
            feature_count: [vec![0.0; n_features], vec![0.0; n_features]],
        }
    }

    pub fn n_features(&self) -> usize {
        self.feature_count[0].len()
    }

    pub fn class_count(&self, label: Label) -> u64 {
        self.class_count[label.index()] as u64
    }

    pub fn partial_fit(&mut self, samples: &[(SparseVector, Label)]) -> Result<()> {
        let n_features = self.n_features();
        if let Some((idx, _)) = samples
            .iter()
            .flat_map(|(row, _)| row.iter())
            .find(|(idx, _)| *idx >= n_features)
        {
            return Err(anyhow!(
                "feature index {} out of range for model with {} features",
                idx,
                n_features
            ));
        }
        for (row, label) in samples {
            let class = label.index();
            self.class_count[class] += 1.0;
            for (idx, weight) in row {
                self.feature_count[class][*idx] += weight;
            }
        }
        Ok(())
    }

    /// Ties and an untrained model resolve to ham.
    pub fn predict(&self, row: &SparseVector) -> Label {
        let scores = self.joint_log_likelihood(row);
        if scores[Label::Spam.index()] > scores[Label::Ham.index()] {
            Label::Spam
        } else {
            Label::Ham
        }
    }

    fn joint_log_likelihood(&self, row: &SparseVector) -> [f64; 2] {
        let total: f64 = self.class_count.iter().sum();
        let n_features = self.n_features() as f64;
        let mut scores = [f64::NEG_INFINITY; 2];
        for class in 0..2 {
            if total <= 0.0 || self.class_count[class] <= 0.0 {
                continue;
            }
            let prior = (self.class_count[class] / total).ln();
            let counts = &self.feature_count[class];
            let denom = (counts.iter().sum::<f64>() + self.alpha * n_features).ln();
            let likelihood: f64 = row
                .iter()
                .filter(|(idx, _)| *idx < counts.len())
                .map(|(idx, x)| x * ((counts[*idx] + self.alpha).ln() - denom))
                .sum();
            scores[class] = prior + likelihood;
        }
        scores
    }
}
