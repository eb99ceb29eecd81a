//! Adam over an explicit parameter subset

use std::collections::BTreeMap;

use super::params::{Gradients, ParameterStore};
use super::{ModelError, ModelResult};

/// Per-parameter moment estimates
#[derive(Clone, Debug)]
struct Moments {
    m: Vec<f64>,
    v: Vec<f64>,
    t: i32,
}

/// Adam optimizer with bias correction.
///
/// The parameter subset is fixed at construction. `step` updates only those
/// names, and only when they currently require gradients and a gradient was
/// computed for them.
#[derive(Clone, Debug)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    names: Vec<String>,
    state: BTreeMap<String, Moments>,
}

impl Adam {
    /// Create for the named parameters with default betas (0.9, 0.999)
    #[must_use]
    pub fn new(names: Vec<String>, lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            names,
            state: BTreeMap::new(),
        }
    }

    /// Apply one update
    pub fn step(&mut self, params: &mut ParameterStore, grads: &Gradients) -> ModelResult<()> {
        for name in &self.names {
            if !params.requires_grad(name) {
                continue;
            }
            let Some(g) = grads.get(name) else {
                continue;
            };
            let tensor = params.get_mut(name)?;
            if g.len() != tensor.values.len() {
                return Err(ModelError::GradientShape {
                    expected: tensor.shape(),
                    got: (1, g.len()),
                });
            }

            let moments = self.state.entry(name.clone()).or_insert_with(|| Moments {
                m: vec![0.0; g.len()],
                v: vec![0.0; g.len()],
                t: 0,
            });
            moments.t += 1;
            let bias_correction1 = 1.0 - self.beta1.powi(moments.t);
            let bias_correction2 = 1.0 - self.beta2.powi(moments.t);

            for (i, (p, &gi)) in tensor.values.iter_mut().zip(g).enumerate() {
                moments.m[i] = self.beta1 * moments.m[i] + (1.0 - self.beta1) * gi;
                moments.v[i] = self.beta2 * moments.v[i] + (1.0 - self.beta2) * gi * gi;
                let m_hat = moments.m[i] / bias_correction1;
                let v_hat = moments.v[i] / bias_correction2;
                *p -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::params::TensorData;
    use approx::assert_relative_eq;

    fn store() -> ParameterStore {
        let mut store = ParameterStore::new();
        store.register_parameter("w", TensorData::filled(1, 2, 1.0));
        store.register_parameter("frozen", TensorData::filled(1, 1, 5.0));
        store
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        let mut params = store();
        let mut grads = Gradients::new();
        grads.insert("w", vec![0.5, -2.0]);

        let mut adam = Adam::new(vec!["w".to_string()], 0.01);
        adam.step(&mut params, &grads).unwrap();

        // bias-corrected first step is lr * sign(g)
        let w = &params.get("w").unwrap().values;
        assert_relative_eq!(w[0], 0.99, epsilon = 1e-6);
        assert_relative_eq!(w[1], 1.01, epsilon = 1e-6);
    }

    #[test]
    fn test_only_owned_and_trainable_names_change() {
        let mut params = store();
        let mut grads = Gradients::new();
        grads.insert("w", vec![1.0, 1.0]);
        grads.insert("frozen", vec![1.0]);

        let mut adam = Adam::new(vec!["w".to_string()], 0.1);
        adam.step(&mut params, &grads).unwrap();
        assert_relative_eq!(params.get("frozen").unwrap().values[0], 5.0);

        params.set_requires_grad("w", false).unwrap();
        let before = params.get("w").unwrap().clone();
        adam.step(&mut params, &grads).unwrap();
        assert_eq!(params.get("w").unwrap(), &before);
    }

    #[test]
    fn test_gradient_length_checked() {
        let mut params = store();
        let mut grads = Gradients::new();
        grads.insert("w", vec![1.0]);
        let mut adam = Adam::new(vec!["w".to_string()], 0.1);
        assert!(matches!(adam.step(&mut params, &grads), Err(ModelError::GradientShape { .. })));
    }
}
