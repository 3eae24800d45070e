//! Adam optimizer with exportable moment state.
//!
//! candle-nn ships an AdamW, but its moment buffers cannot be read back out,
//! and checkpoints here must round-trip the full optimizer state. This
//! implementation keeps one first/second moment tensor per parameter, keyed
//! by parameter name so state files survive a change in slot order.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use thorax_core::{Result, ThoraxError};

/// Adam hyperparameters. Defaults match the training recipe: lr 1e-4,
/// betas (0.9, 0.999), eps 1e-8, no weight decay.
#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

struct Slot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

/// Adam over a fixed set of named parameters.
pub struct Adam {
    config: AdamConfig,
    slots: Vec<Slot>,
    step: usize,
}

impl Adam {
    pub fn new(parameters: Vec<(String, Var)>, config: AdamConfig) -> Result<Self> {
        let mut slots = Vec::with_capacity(parameters.len());
        for (name, param) in parameters {
            let first_moment = param.zeros_like()?;
            let second_moment = param.zeros_like()?;
            slots.push(Slot {
                name,
                param,
                first_moment,
                second_moment,
            });
        }
        Ok(Self {
            config,
            slots,
            step: 0,
        })
    }

    /// Number of optimizer steps taken so far.
    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Apply one Adam update from a populated gradient store. Parameters
    /// without a gradient (batch-norm running statistics) are skipped.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step += 1;
        let t = self.step as i32;
        let cfg = self.config;
        let bias1 = 1.0 - cfg.beta1.powi(t);
        let bias2 = 1.0 - cfg.beta2.powi(t);

        for slot in &mut self.slots {
            let Some(grad) = grads.get(slot.param.as_tensor()) else {
                continue;
            };
            let grad = if cfg.weight_decay > 0.0 {
                ((slot.param.as_tensor() * cfg.weight_decay)? + grad)?
            } else {
                grad.clone()
            };

            let first = ((&slot.first_moment * cfg.beta1)? + (&grad * (1.0 - cfg.beta1))?)?;
            let second = ((&slot.second_moment * cfg.beta2)? + (grad.sqr()? * (1.0 - cfg.beta2))?)?;

            let first_hat = (&first / bias1)?;
            let second_hat = (&second / bias2)?;
            let denom = (second_hat.sqrt()? + cfg.epsilon)?;
            let update = ((first_hat / denom)? * cfg.learning_rate)?;

            let updated = (slot.param.as_tensor() - update)?;
            slot.param.set(&updated)?;
            slot.first_moment = first;
            slot.second_moment = second;
        }
        Ok(())
    }

    /// Moment tensors keyed by `{param}.m` / `{param}.v`, for safetensors
    /// persistence.
    pub fn export_state(&self) -> HashMap<String, Tensor> {
        let mut state = HashMap::with_capacity(self.slots.len() * 2);
        for slot in &self.slots {
            state.insert(format!("{}.m", slot.name), slot.first_moment.clone());
            state.insert(format!("{}.v", slot.name), slot.second_moment.clone());
        }
        state
    }

    /// Restore moment tensors and the step counter from a previously
    /// exported state. Every slot must be covered.
    pub fn import_state(&mut self, state: &HashMap<String, Tensor>, step: usize) -> Result<()> {
        for slot in &mut self.slots {
            let first = state.get(&format!("{}.m", slot.name)).ok_or_else(|| {
                ThoraxError::Checkpoint(format!("optimizer state missing {}.m", slot.name))
            })?;
            let second = state.get(&format!("{}.v", slot.name)).ok_or_else(|| {
                ThoraxError::Checkpoint(format!("optimizer state missing {}.v", slot.name))
            })?;
            let device = slot.param.device();
            slot.first_moment = first.to_device(device)?;
            slot.second_moment = second.to_device(device)?;
        }
        self.step = step;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    fn scalar_var(value: f32) -> Var {
        Var::from_tensor(&Tensor::new(&[value], &Device::Cpu).unwrap()).unwrap()
    }

    #[test]
    fn step_moves_parameter_against_gradient() {
        let var = scalar_var(1.0);
        let mut adam = Adam::new(
            vec![("w".to_string(), var.clone())],
            AdamConfig {
                learning_rate: 0.1,
                ..Default::default()
            },
        )
        .unwrap();

        // Minimize w^2: gradient is 2w, so w must decrease.
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        adam.step(&grads).unwrap();

        let updated = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!(updated < 1.0, "expected decrease, got {updated}");
        assert_eq!(adam.step_count(), 1);
    }

    #[test]
    fn state_round_trip_preserves_moments() {
        let var = scalar_var(0.5);
        let mut adam = Adam::new(vec![("w".to_string(), var.clone())], AdamConfig::default())
            .unwrap();
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        adam.step(&grads).unwrap();

        let state = adam.export_state();
        let mut fresh =
            Adam::new(vec![("w".to_string(), var.clone())], AdamConfig::default()).unwrap();
        fresh.import_state(&state, adam.step_count()).unwrap();

        assert_eq!(fresh.step_count(), 1);
        let original = adam.export_state();
        let restored = fresh.export_state();
        for key in ["w.m", "w.v"] {
            assert_eq!(
                original[key].to_vec1::<f32>().unwrap(),
                restored[key].to_vec1::<f32>().unwrap()
            );
        }
    }

    #[test]
    fn missing_state_entry_is_rejected() {
        let var = scalar_var(0.5);
        let mut adam =
            Adam::new(vec![("w".to_string(), var)], AdamConfig::default()).unwrap();
        let empty = HashMap::new();
        assert!(adam.import_state(&empty, 3).is_err());
    }

    #[test]
    fn zeros_like_moments_dtype() {
        let var = scalar_var(2.0);
        let adam = Adam::new(vec![("w".to_string(), var)], AdamConfig::default()).unwrap();
        let state = adam.export_state();
        assert_eq!(state["w.m"].dtype(), DType::F32);
    }
}
