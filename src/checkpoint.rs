//! Training checkpoints.
//!
//! Model and optimizer states are kept opaque: the sampling side only needs
//! the configuration stored alongside them to rebuild the noise schedule.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DiffusionConfig;
use crate::error::{DiffusionError, Result};
use crate::schedulers::NoiseSchedule;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: usize,
    pub model_state_dict: Value,
    pub num_optimizers: usize,
    #[serde(default)]
    pub optimizer_state_dicts: Vec<Value>,
    pub loss: f64,
    pub config: DiffusionConfig,
}

impl Checkpoint {
    pub fn new(step: usize, loss: f64, config: DiffusionConfig) -> Self {
        Self {
            step,
            model_state_dict: Value::Null,
            num_optimizers: 0,
            optimizer_state_dicts: Vec::new(),
            loss,
            config,
        }
    }

    pub fn with_model_state_dict(mut self, model_state_dict: Value) -> Self {
        self.model_state_dict = model_state_dict;
        self
    }

    pub fn with_optimizer_state_dicts(mut self, optimizer_state_dicts: Vec<Value>) -> Self {
        self.num_optimizers = optimizer_state_dicts.len();
        self.optimizer_state_dicts = optimizer_state_dicts;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_optimizers != self.optimizer_state_dicts.len() {
            return Err(DiffusionError::InvalidConfig(format!(
                "checkpoint declares {} optimizers but stores {} states",
                self.num_optimizers,
                self.optimizer_state_dicts.len()
            )));
        }
        self.config.validate()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let checkpoint: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        checkpoint.validate()?;
        log::info!(
            "Loaded checkpoint {} at step {} (loss {:.6})",
            path.display(),
            checkpoint.step,
            checkpoint.loss
        );
        Ok(checkpoint)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn noise_schedule(&self) -> Result<NoiseSchedule> {
        self.config.noise_schedule()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataConfig;
    use crate::schedulers::{BetaSchedule, NoiseScheduleConfig};
    use serde_json::json;

    fn checkpoint() -> Checkpoint {
        let config = DiffusionConfig::new(
            DataConfig {
                image_size: 32,
                num_channels: 3,
                input_number_of_frames: None,
            },
            NoiseScheduleConfig::new(200, BetaSchedule::SquaredcosCapV2),
        );
        Checkpoint::new(1200, 0.031, config)
            .with_model_state_dict(json!({ "conv_in.weight": [0.1, 0.2] }))
            .with_optimizer_state_dicts(vec![json!({ "lr": 1e-4 })])
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let expected = checkpoint();

        expected.save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();

        assert_eq!(loaded, expected);
        assert_eq!(loaded.noise_schedule().unwrap().steps(), 200);
    }

    #[test]
    fn test_state_dict_field_names() {
        let value = serde_json::to_value(checkpoint()).unwrap();

        assert_eq!(value["model_state_dict"], json!({ "conv_in.weight": [0.1, 0.2] }));
        assert_eq!(value["optimizer_state_dicts"], json!([{ "lr": 1e-4 }]));
        assert_eq!(value["num_optimizers"], json!(1));
        assert!(value.get("model_state").is_none());
    }

    #[test]
    fn test_optimizer_count_must_match() {
        let mut checkpoint = checkpoint();
        checkpoint.num_optimizers = 2;

        assert!(matches!(checkpoint.validate(), Err(DiffusionError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Checkpoint::load(dir.path().join("missing.json"));

        assert!(matches!(result, Err(DiffusionError::Io(_))));
    }
}
