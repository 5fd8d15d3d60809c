//! Per-user ham/spam classifier: TF-IDF features over `subject + "\n" + body`
//! and an incrementally trainable multinomial naive Bayes model.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use cozymail_core::UserId;

mod bayes;
mod store;
mod tfidf;

pub use bayes::MultinomialNb;
pub use store::{ArtifactKind, FsModelStore, MemoryModelStore, ModelStore};
pub use tfidf::{SparseVector, TfidfVectorizer, tokenize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Ham = 0,
    Spam = 1,
}

impl Label {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingSample {
    pub subject: String,
    pub body: String,
    pub label: Label,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub ham: u64,
    pub spam: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub vocabulary: usize,
    pub counts: ClassCounts,
}

pub fn feature_text(subject: &str, body: &str) -> String {
    format!("{}\n{}", subject, body)
}

pub struct SpamClassifier {
    store: Arc<dyn ModelStore>,
    user_locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl SpamClassifier {
    pub fn new(store: Arc<dyn ModelStore>) -> Self {
        Self {
            store,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Never fails: missing or unreadable artifacts mean ham.
    pub fn predict(&self, user: UserId, subject: &str, body: &str) -> Label {
        match self.try_predict(user, &feature_text(subject, body)) {
            Ok(Some(label)) => label,
            Ok(None) => Label::Ham,
            Err(err) => {
                tracing::warn!(user_id = %user, error = %err, "classifier unavailable, treating as ham");
                Label::Ham
            }
        }
    }

    fn try_predict(&self, user: UserId, text: &str) -> Result<Option<Label>> {
        let Some(vectorizer) = self.load_vectorizer(user)? else {
            return Ok(None);
        };
        let Some(model) = self.load_model(user)? else {
            return Ok(None);
        };
        check_shape(&vectorizer, &model)?;
        Ok(Some(model.predict(&vectorizer.transform(text))))
    }

    /// Fits a fresh vectorizer and model and replaces both artifacts.
    /// An empty sample set leaves existing artifacts untouched.
    pub fn train_bulk(
        &self,
        user: UserId,
        samples: &[TrainingSample],
    ) -> Result<Option<TrainingReport>> {
        if samples.is_empty() {
            tracing::warn!(user_id = %user, "no training data, skipping bulk training");
            return Ok(None);
        }
        let lock = self.user_lock(user);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let texts: Vec<String> = samples
            .iter()
            .map(|s| feature_text(&s.subject, &s.body))
            .collect();
        let vectorizer = TfidfVectorizer::fit(&texts)?;
        let rows: Vec<(SparseVector, Label)> = texts
            .iter()
            .zip(samples)
            .map(|(text, sample)| (vectorizer.transform(text), sample.label))
            .collect();
        let mut model = MultinomialNb::new(vectorizer.len());
        model.partial_fit(&rows)?;

        self.store.put(
            user,
            ArtifactKind::Vectorizer,
            &serde_json::to_vec(&vectorizer)?,
        )?;
        self.store
            .put(user, ArtifactKind::Model, &serde_json::to_vec(&model)?)?;

        let report = TrainingReport {
            vocabulary: vectorizer.len(),
            counts: counts_of(&model),
        };
        tracing::info!(
            user_id = %user,
            vocabulary = report.vocabulary,
            spam = report.counts.spam,
            ham = report.counts.ham,
            "bulk training complete"
        );
        Ok(Some(report))
    }

    /// One update step with the stored vocabulary. Returns the class counts
    /// after the update, or `None` when no vectorizer has been trained yet.
    pub fn train_incremental(
        &self,
        user: UserId,
        subject: &str,
        body: &str,
        label: Label,
    ) -> Result<Option<ClassCounts>> {
        let lock = self.user_lock(user);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(vectorizer) = self.load_vectorizer(user)? else {
            tracing::info!(user_id = %user, "no vectorizer yet, skipping incremental training");
            return Ok(None);
        };
        let mut model = match self.load_model(user)? {
            Some(model) => model,
            None => MultinomialNb::new(vectorizer.len()),
        };
        check_shape(&vectorizer, &model)?;

        let row = vectorizer.transform(&feature_text(subject, body));
        model.partial_fit(&[(row, label)])?;
        self.store
            .put(user, ArtifactKind::Model, &serde_json::to_vec(&model)?)?;
        Ok(Some(counts_of(&model)))
    }

    pub fn class_counts(&self, user: UserId) -> Result<Option<ClassCounts>> {
        Ok(self.load_model(user)?.map(|model| counts_of(&model)))
    }

    fn load_vectorizer(&self, user: UserId) -> Result<Option<TfidfVectorizer>> {
        match self.store.get(user, ArtifactKind::Vectorizer)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_model(&self, user: UserId) -> Result<Option<MultinomialNb>> {
        match self.store.get(user, ArtifactKind::Model)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn user_lock(&self, user: UserId) -> Arc<Mutex<()>> {
        let mut locks = self
            .user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(user).or_default().clone()
    }
}

fn check_shape(vectorizer: &TfidfVectorizer, model: &MultinomialNb) -> Result<()> {
    if vectorizer.len() != model.n_features() {
        return Err(anyhow!(
            "model expects {} features but vectorizer has {}",
            model.n_features(),
            vectorizer.len()
        ));
    }
    Ok(())
}

fn counts_of(model: &MultinomialNb) -> ClassCounts {
    ClassCounts {
        ham: model.class_count(Label::Ham),
        spam: model.class_count(Label::Spam),
    }
}
