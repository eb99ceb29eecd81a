//! Named parameter storage
//!
//! Parameters and buffers are kept in registration order under dotted names
//! (`norm.weight`, `norm.running_mean`, ...). A `StateDict` is the
//! serializable snapshot of every tensor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ModelError, ModelResult};

/// Dense row-major tensor with at most two dimensions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    /// Number of rows
    pub rows: usize,
    /// Number of columns
    pub cols: usize,
    /// Row-major values
    pub values: Vec<f64>,
}

impl TensorData {
    /// Tensor filled with a constant
    #[must_use]
    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self { rows, cols, values: vec![value; rows * cols] }
    }

    /// Shape as (rows, cols)
    #[inline]
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }
}

/// Whether a tensor is learnable or a statistics buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorKind {
    /// Learnable parameter
    Parameter,
    /// Non-learnable state (e.g. running statistics)
    Buffer,
}

#[derive(Clone, Debug)]
struct Entry {
    name: String,
    kind: TensorKind,
    data: TensorData,
    requires_grad: bool,
}

/// Serializable snapshot of every parameter and buffer
pub type StateDict = BTreeMap<String, TensorData>;

/// Ordered store of named parameters and buffers
#[derive(Clone, Debug, Default)]
pub struct ParameterStore {
    entries: Vec<Entry>,
}

impl ParameterStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a learnable parameter (gradient enabled)
    pub fn register_parameter(&mut self, name: &str, data: TensorData) {
        self.entries.push(Entry {
            name: name.to_string(),
            kind: TensorKind::Parameter,
            data,
            requires_grad: true,
        });
    }

    /// Register a buffer (never receives gradients)
    pub fn register_buffer(&mut self, name: &str, data: TensorData) {
        self.entries.push(Entry {
            name: name.to_string(),
            kind: TensorKind::Buffer,
            data,
            requires_grad: false,
        });
    }

    fn entry(&self, name: &str) -> ModelResult<&Entry> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| ModelError::UnknownParameter(name.to_string()))
    }

    fn entry_mut(&mut self, name: &str) -> ModelResult<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| ModelError::UnknownParameter(name.to_string()))
    }

    /// Tensor by name
    pub fn get(&self, name: &str) -> ModelResult<&TensorData> {
        self.entry(name).map(|e| &e.data)
    }

    /// Mutable tensor by name
    pub fn get_mut(&mut self, name: &str) -> ModelResult<&mut TensorData> {
        self.entry_mut(name).map(|e| &mut e.data)
    }

    /// Names of parameters that currently receive gradients
    pub fn trainable_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.requires_grad)
            .map(|e| e.name.clone())
            .collect()
    }

    /// Whether the named tensor receives gradients; `false` if unknown
    pub fn requires_grad(&self, name: &str) -> bool {
        self.entry(name).is_ok_and(|e| e.requires_grad)
    }

    /// Enable or disable gradients for one parameter
    pub fn set_requires_grad(&mut self, name: &str, requires_grad: bool) -> ModelResult<()> {
        let entry = self.entry_mut(name)?;
        if entry.kind == TensorKind::Buffer && requires_grad {
            return Err(ModelError::NotLearnable(name.to_string()));
        }
        entry.requires_grad = requires_grad;
        Ok(())
    }

    /// Freeze every parameter except `keep`.
    ///
    /// Every name in `keep` must be a registered parameter.
    pub fn freeze_all_except(&mut self, keep: &[String]) -> ModelResult<()> {
        for name in keep {
            if self.entry(name)?.kind != TensorKind::Parameter {
                return Err(ModelError::NotLearnable(name.clone()));
            }
        }
        for entry in &mut self.entries {
            entry.requires_grad = entry.kind == TensorKind::Parameter && keep.contains(&entry.name);
        }
        Ok(())
    }

    /// Re-enable gradients on every parameter
    pub fn unfreeze_all(&mut self) {
        for entry in &mut self.entries {
            entry.requires_grad = entry.kind == TensorKind::Parameter;
        }
    }

    /// Snapshot of all tensors
    pub fn state_dict(&self) -> StateDict {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.data.clone()))
            .collect()
    }

    /// Restore every tensor from a snapshot.
    ///
    /// All registered names must be present with matching shapes; the store is
    /// left untouched on error.
    pub fn load_state_dict(&mut self, state: &StateDict) -> ModelResult<()> {
        for entry in &self.entries {
            let incoming = state
                .get(&entry.name)
                .ok_or_else(|| ModelError::MissingTensor(entry.name.clone()))?;
            if incoming.shape() != entry.data.shape() || incoming.values.len() != entry.data.values.len() {
                return Err(ModelError::TensorShape {
                    name: entry.name.clone(),
                    expected: entry.data.shape(),
                    actual: incoming.shape(),
                });
            }
        }
        for entry in &mut self.entries {
            if let Some(incoming) = state.get(&entry.name) {
                entry.data.values.clone_from(&incoming.values);
            }
        }
        Ok(())
    }
}

/// Gradients keyed by parameter name
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Gradients {
    grads: BTreeMap<String, Vec<f64>>,
}

impl Gradients {
    /// Empty gradient set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the gradient of one parameter
    pub fn insert(&mut self, name: &str, grad: Vec<f64>) {
        self.grads.insert(name.to_string(), grad);
    }

    /// Gradient of one parameter, if computed
    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.grads.get(name).map(Vec::as_slice)
    }

    /// Names with a gradient
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.grads.keys().map(String::as_str)
    }

    /// Add `other` element-wise, taking over names missing here
    pub fn accumulate(&mut self, other: &Gradients) -> ModelResult<()> {
        for (name, grad) in &other.grads {
            match self.grads.get_mut(name) {
                Some(existing) => {
                    if existing.len() != grad.len() {
                        return Err(ModelError::GradientShape { expected: (1, existing.len()), got: (1, grad.len()) });
                    }
                    for (a, b) in existing.iter_mut().zip(grad) {
                        *a += b;
                    }
                }
                None => {
                    self.grads.insert(name.clone(), grad.clone());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ParameterStore {
        let mut store = ParameterStore::new();
        store.register_parameter("a.weight", TensorData::filled(2, 2, 1.0));
        store.register_parameter("a.bias", TensorData::filled(1, 2, 0.0));
        store.register_buffer("a.running_mean", TensorData::filled(1, 2, 0.0));
        store
    }

    #[test]
    fn test_freeze_all_except() {
        let mut store = store();
        store.freeze_all_except(&["a.bias".to_string()]).unwrap();
        assert_eq!(store.trainable_names(), vec!["a.bias".to_string()]);
        assert!(!store.requires_grad("a.weight"));

        store.unfreeze_all();
        assert_eq!(store.trainable_names().len(), 2);
    }

    #[test]
    fn test_accumulate_sums_and_merges() {
        let mut total = Gradients::new();
        total.insert("a", vec![1.0, 2.0]);
        let mut other = Gradients::new();
        other.insert("a", vec![0.5, -2.0]);
        other.insert("b", vec![3.0]);
        total.accumulate(&other).unwrap();
        assert_eq!(total.get("a"), Some(&[1.5, 0.0][..]));
        assert_eq!(total.get("b"), Some(&[3.0][..]));
        assert_eq!(total.names().collect::<Vec<_>>(), vec!["a", "b"]);

        let mut short = Gradients::new();
        short.insert("a", vec![1.0]);
        assert!(matches!(total.accumulate(&short), Err(ModelError::GradientShape { .. })));
    }

    #[test]
    fn test_buffers_cannot_be_adapted() {
        let mut store = store();
        assert!(matches!(
            store.freeze_all_except(&["a.running_mean".to_string()]),
            Err(ModelError::NotLearnable(_))
        ));
        assert!(matches!(
            store.freeze_all_except(&["missing".to_string()]),
            Err(ModelError::UnknownParameter(_))
        ));
    }

    #[test]
    fn test_state_dict_round_trip() {
        let mut store = store();
        let mut state = store.state_dict();
        state.get_mut("a.weight").unwrap().values = vec![4.0, 3.0, 2.0, 1.0];
        store.load_state_dict(&state).unwrap();
        assert_eq!(store.get("a.weight").unwrap().values, vec![4.0, 3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_load_rejects_wrong_shape_without_partial_write() {
        let mut store = store();
        let mut state = store.state_dict();
        state.get_mut("a.weight").unwrap().values = vec![9.0; 4];
        state.insert("a.bias".to_string(), TensorData::filled(1, 3, 0.0));
        assert!(matches!(store.load_state_dict(&state), Err(ModelError::TensorShape { .. })));
        assert_eq!(store.get("a.weight").unwrap().values, vec![1.0; 4]);
    }
}
