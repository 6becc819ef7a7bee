use std::str::FromStr;

use tracing::{debug, warn};

use crate::{
    error::Result,
    labels::LabelStore,
    model::{log_softmax, Model},
    preprocess::{ImageTensor, Preprocessor},
};

const UNKNOWN_LABEL: &str = "Unknown";

/// How an output index is turned into a key of the label table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelMapping {
    /// Key is `index + 1`.
    Offset,
    /// Key is the class whose `class_to_idx` entry equals the index.
    Checkpoint,
}

impl FromStr for LabelMapping {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "offset" => Ok(LabelMapping::Offset),
            "checkpoint" => Ok(LabelMapping::Checkpoint),
            other => Err(format!("expected 'offset' or 'checkpoint', got '{other}'")),
        }
    }
}

/// Top-k result, best first. `scores` are log-probabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub scores: Vec<f32>,
    pub labels: Vec<String>,
}

/// Outcome of checking the label table against the model's class space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingAudit {
    /// Classes whose checkpoint index is not `key - 1`.
    pub offset_disagreements: usize,
    /// Output indices that resolve to no label.
    pub missing_labels: Vec<usize>,
}

pub struct Predictor {
    model: Model,
    labels: LabelStore,
    preprocessor: Preprocessor,
    index_keys: Vec<Option<String>>,
    top_k: usize,
}

impl Predictor {
    pub fn new(
        model: Model,
        labels: LabelStore,
        preprocessor: Preprocessor,
        mapping: LabelMapping,
        top_k: usize,
    ) -> Self {
        let index_keys = index_keys(&model, mapping);
        let predictor = Self {
            model,
            labels,
            preprocessor,
            index_keys,
            top_k,
        };

        let audit = predictor.audit();
        if audit.offset_disagreements > 0 {
            warn!(
                "Checkpoint class_to_idx disagrees with the index+1 label convention for {} classes (mapping: {:?})",
                audit.offset_disagreements, mapping
            );
        }
        if !audit.missing_labels.is_empty() {
            warn!(
                "{} of {} model outputs have no label and will be reported as {}",
                audit.missing_labels.len(),
                predictor.model.num_classes(),
                UNKNOWN_LABEL
            );
        }
        predictor
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn audit(&self) -> MappingAudit {
        let offset_disagreements = self
            .model
            .class_to_idx()
            .iter()
            .filter(|&(class, &idx)| *class != (idx + 1).to_string())
            .count();
        let missing_labels = self
            .index_keys
            .iter()
            .enumerate()
            .filter(|(_, key)| !key.as_deref().is_some_and(|k| self.labels.contains(k)))
            .map(|(index, _)| index)
            .collect();

        MappingAudit {
            offset_disagreements,
            missing_labels,
        }
    }

    /// Preprocesses the image and predicts with the configured `top_k`.
    pub fn classify(&self, image_data: &[u8]) -> Result<Prediction> {
        let input = self.preprocessor.transform(image_data)?;
        self.predict(&input, self.top_k)
    }

    pub fn predict(&self, input: &ImageTensor, k: usize) -> Result<Prediction> {
        let output = self.model.forward(input)?;
        let log_probs = log_softmax(&output)?;

        let (scores, labels) = top_k(&log_probs, k)
            .into_iter()
            .map(|(index, score)| (score, self.label(index).to_string()))
            .unzip();
        let prediction = Prediction { scores, labels };
        debug!("Prediction: {:?}", prediction.labels);
        Ok(prediction)
    }

    fn label(&self, index: usize) -> &str {
        self.index_keys
            .get(index)
            .and_then(|key| key.as_deref())
            .and_then(|key| self.labels.name(key))
            .unwrap_or(UNKNOWN_LABEL)
    }
}

fn index_keys(model: &Model, mapping: LabelMapping) -> Vec<Option<String>> {
    let classes = model.num_classes();
    match mapping {
        LabelMapping::Offset => (0..classes).map(|i| Some((i + 1).to_string())).collect(),
        LabelMapping::Checkpoint => {
            let mut keys = vec![None; classes];
            for (class, &idx) in model.class_to_idx() {
                if let Some(slot) = keys.get_mut(idx) {
                    *slot = Some(class.clone());
                }
            }
            keys
        }
    }
}

/// Indices and values of the `k` largest scores, best first. Ties keep index order.
pub fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    ranked.truncate(k);
    ranked
}
