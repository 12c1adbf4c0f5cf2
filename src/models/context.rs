use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

/// Key under which class labels are stored.
pub const CLASSES: &str = "classes";
/// Key under which text prompts are stored.
pub const TEXT_PROMPTS: &str = "text_prompts";
/// Key under which the current training step is stored.
pub const STEP: &str = "step";
/// Key under which the total number of training steps is stored.
pub const TOTAL_STEPS: &str = "total_steps";

/// A single conditioning value.
#[derive(Debug, Clone)]
pub enum ContextValue<B: Backend, const D: usize> {
    /// Integer class labels, `[batch, labels_per_sample]`.
    Labels(Tensor<B, 2, Int>),
    /// One prompt per sample.
    Prompts(Vec<String>),
    /// A tensor with the sample's rank, e.g. a low resolution image.
    Signal(Tensor<B, D>),
    Scalar(f64),
}

impl<B: Backend, const D: usize> ContextValue<B, D> {
    /// Semantic conditioning is what classifier-free guidance removes.
    pub fn is_semantic(&self) -> bool {
        matches!(self, ContextValue::Labels(_) | ContextValue::Prompts(_))
    }
}

/// Conditioning handed to a [denoiser](crate::models::Denoiser).
///
/// Samplers only ever read it.
#[derive(Debug, Clone)]
pub struct Context<B: Backend, const D: usize> {
    entries: BTreeMap<String, ContextValue<B, D>>,
}

impl<B: Backend, const D: usize> Default for Context<B, D> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<B: Backend, const D: usize> Context<B, D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ContextValue<B, D>) {
        self.entries.insert(key.into(), value);
    }

    pub fn with(mut self, key: impl Into<String>, value: ContextValue<B, D>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn with_labels(self, labels: Tensor<B, 2, Int>) -> Self {
        self.with(CLASSES, ContextValue::Labels(labels))
    }

    pub fn with_prompts(self, prompts: Vec<String>) -> Self {
        self.with(TEXT_PROMPTS, ContextValue::Prompts(prompts))
    }

    pub fn with_signal(self, key: impl Into<String>, signal: Tensor<B, D>) -> Self {
        self.with(key, ContextValue::Signal(signal))
    }

    pub fn with_scalar(self, key: impl Into<String>, value: f64) -> Self {
        self.with(key, ContextValue::Scalar(value))
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue<B, D>> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn labels(&self, key: &str) -> Option<&Tensor<B, 2, Int>> {
        match self.get(key) {
            Some(ContextValue::Labels(labels)) => Some(labels),
            _ => None,
        }
    }

    pub fn prompts(&self, key: &str) -> Option<&[String]> {
        match self.get(key) {
            Some(ContextValue::Prompts(prompts)) => Some(prompts),
            _ => None,
        }
    }

    pub fn signal(&self, key: &str) -> Option<&Tensor<B, D>> {
        match self.get(key) {
            Some(ContextValue::Signal(signal)) => Some(signal),
            _ => None,
        }
    }

    pub fn scalar(&self, key: &str) -> Option<f64> {
        match self.get(key) {
            Some(ContextValue::Scalar(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The null context of classifier-free guidance.
    ///
    /// Labels and prompts are dropped; structural conditioning such as a low
    /// resolution image or the training step is kept.
    pub fn unconditional(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(_, value)| !value.is_semantic())
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;

    #[test]
    fn test_unconditional_keeps_structural_entries() {
        let device = Default::default();
        let context = Context::<TestBackend, 4>::new()
            .with_labels(Tensor::zeros([2, 1], &device))
            .with_prompts(vec!["zero".into(), "one".into()])
            .with_signal("low_resolution", Tensor::zeros([2, 1, 4, 4], &device))
            .with_scalar(STEP, 3.0);

        let unconditional = context.unconditional();

        assert_eq!(context.len(), 4);
        assert_eq!(unconditional.len(), 2);
        assert!(unconditional.labels(CLASSES).is_none());
        assert!(unconditional.prompts(TEXT_PROMPTS).is_none());
        assert!(unconditional.signal("low_resolution").is_some());
        assert_eq!(unconditional.scalar(STEP), Some(3.0));
    }

    #[test]
    fn test_typed_accessors() {
        let context =
            Context::<TestBackend, 4>::new().with_prompts(vec!["a cat".into()]);

        assert_eq!(context.prompts(TEXT_PROMPTS), Some(&["a cat".to_string()][..]));
        assert!(context.signal(TEXT_PROMPTS).is_none());
        assert!(context.contains(TEXT_PROMPTS));
        assert_eq!(context.keys().collect::<Vec<_>>(), vec![TEXT_PROMPTS]);
    }
}
