/// Meta-parameter views.
///
/// Two views of the same named parameters coexist:
/// - `ParamStore`: persistent values owned by a model (plus the gradient the
///   outer loop accumulates into them). Only the outer optimizer mutates it.
/// - `ParamMap`: a transient name → `BufId` snapshot on one tape. Inner-loop
///   updates produce new maps; a map never aliases store memory because tape
///   registration clones.
///
/// Both are insertion-ordered (`IndexMap`), so parameter order is stable
/// across registration, updates, and optimizer state.

use indexmap::IndexMap;

use crate::error::{MetaError, Result};
use crate::tape::{BufId, Tape};
use crate::tensor::Tensor;

// ── Persistent parameters ────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct Parameter {
    pub value: Tensor,
    /// Accumulated outer-loop gradient. `None` until something writes it.
    pub grad: Option<Vec<f32>>,
}

impl Parameter {
    pub fn new(value: Tensor) -> Self {
        Parameter { value, grad: None }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ParamStore {
    params: IndexMap<String, Parameter>,
}

impl ParamStore {
    pub fn new() -> Self {
        ParamStore { params: IndexMap::new() }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Tensor) {
        self.params.insert(name.into(), Parameter::new(value));
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.get_mut(name)
    }

    pub fn value(&self, name: &str) -> Result<&Tensor> {
        self.params.get(name)
            .map(|p| &p.value)
            .ok_or_else(|| MetaError::MissingParameter(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.params.keys()
    }

    /// (name, parameter) pairs in registration order.
    pub fn named_parameters(&self) -> impl Iterator<Item = (&String, &Parameter)> {
        self.params.iter()
    }

    pub fn named_parameters_mut(&mut self) -> impl Iterator<Item = (&String, &mut Parameter)> {
        self.params.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn num_elements(&self) -> usize {
        self.params.values().map(|p| p.value.numel()).sum()
    }

    pub fn zero_grad(&mut self) {
        for p in self.params.values_mut() {
            p.grad = None;
        }
    }

    /// Add `grad` into the named parameter's gradient buffer.
    pub fn accumulate_grad(&mut self, name: &str, grad: &[f32]) -> Result<()> {
        let p = self.params.get_mut(name)
            .ok_or_else(|| MetaError::MissingParameter(name.to_string()))?;
        if grad.len() != p.value.numel() {
            return Err(MetaError::ShapeMismatch {
                op: "accumulate_grad",
                left: p.value.shape.clone(),
                right: vec![grad.len()],
            });
        }
        match &mut p.grad {
            Some(acc) => {
                for (a, g) in acc.iter_mut().zip(grad.iter()) {
                    *a += g;
                }
            }
            None => p.grad = Some(grad.to_vec()),
        }
        Ok(())
    }

    /// Register every parameter on `tape` as a differentiable leaf.
    pub fn register(&self, tape: &mut Tape) -> ParamMap {
        self.register_with(tape, true)
    }

    pub fn register_with(&self, tape: &mut Tape, requires_grad: bool) -> ParamMap {
        self.params.iter()
            .map(|(name, p)| {
                let id = tape.leaf(p.value.data.clone(), p.value.shape.clone(), requires_grad);
                (name.clone(), id)
            })
            .collect()
    }

    /// Copy the values of a tape snapshot back into a fresh store.
    pub fn from_map(tape: &Tape, map: &ParamMap) -> ParamStore {
        let mut store = ParamStore::new();
        for (name, &id) in map.iter() {
            store.insert(name.clone(), tape.to_tensor(id));
        }
        store
    }
}

// ── Transient snapshots ──────────────────────────────────────────────

/// Ordered name → tape buffer mapping. Cheap to clone; `BufId`s are immutable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamMap {
    entries: IndexMap<String, BufId>,
}

impl ParamMap {
    pub fn new() -> Self {
        ParamMap { entries: IndexMap::new() }
    }

    pub fn insert(&mut self, name: impl Into<String>, id: BufId) {
        self.entries.insert(name.into(), id);
    }

    pub fn get(&self, name: &str) -> Option<BufId> {
        self.entries.get(name).copied()
    }

    pub fn require(&self, name: &str) -> Result<BufId> {
        self.get(name).ok_or_else(|| MetaError::MissingParameter(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BufId)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn ids(&self) -> Vec<BufId> {
        self.entries.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn same_keys(&self, other: &ParamMap) -> bool {
        self.len() == other.len() && self.keys().all(|k| other.contains(k))
    }

    pub fn check_same_keys(&self, other: &ParamMap) -> Result<()> {
        if self.same_keys(other) {
            Ok(())
        } else {
            Err(MetaError::KeySetMismatch { expected: self.len(), found: other.len() })
        }
    }
}

impl FromIterator<(String, BufId)> for ParamMap {
    fn from_iter<I: IntoIterator<Item = (String, BufId)>>(iter: I) -> Self {
        ParamMap { entries: iter.into_iter().collect() }
    }
}

// ── Step sizes ───────────────────────────────────────────────────────

/// Inner-loop step size as seen on a tape.
#[derive(Clone, Debug)]
pub enum StepSize {
    /// One value shared by every parameter.
    Scalar(BufId),
    /// One value per parameter name. Key set equals the meta-parameter key set.
    PerParam(ParamMap),
}

impl StepSize {
    /// Step-size buffer that applies to parameter `name`.
    pub fn for_param(&self, name: &str) -> Result<BufId> {
        match self {
            StepSize::Scalar(id) => Ok(*id),
            StepSize::PerParam(map) => map.require(name),
        }
    }

    pub fn is_per_param(&self) -> bool {
        matches!(self, StepSize::PerParam(_))
    }
}

/// Name of the single entry of a shared step size.
pub const SHARED_STEP_SIZE: &str = "step_size";

/// Persistent (optionally learnable) step sizes owned by the meta-learner.
#[derive(Clone, Debug)]
pub struct StepSizeStore {
    values: ParamStore,
    per_param: bool,
    learnable: bool,
}

impl StepSizeStore {
    pub fn scalar(value: f32, learnable: bool) -> Self {
        let mut values = ParamStore::new();
        values.insert(SHARED_STEP_SIZE, Tensor::scalar(value));
        StepSizeStore { values, per_param: false, learnable }
    }

    pub fn per_param<'a>(names: impl IntoIterator<Item = &'a String>, value: f32, learnable: bool) -> Self {
        let mut values = ParamStore::new();
        for name in names {
            values.insert(name.clone(), Tensor::scalar(value));
        }
        StepSizeStore { values, per_param: true, learnable }
    }

    pub fn is_learnable(&self) -> bool {
        self.learnable
    }

    pub fn is_per_param(&self) -> bool {
        self.per_param
    }

    pub fn params(&self) -> &ParamStore {
        &self.values
    }

    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.values
    }

    /// Value applied to parameter `name`.
    pub fn value(&self, name: &str) -> Result<f32> {
        let key = if self.per_param { name } else { SHARED_STEP_SIZE };
        Ok(self.values.value(key)?.data[0])
    }

    /// Place the step sizes on `tape`. Learnable ones are differentiable leaves.
    pub fn register(&self, tape: &mut Tape) -> StepSize {
        let map = self.values.register_with(tape, self.learnable);
        if self.per_param {
            StepSize::PerParam(map)
        } else {
            // Registered from a single-entry store, so the key is present.
            StepSize::Scalar(map.ids()[0])
        }
    }

    /// Zero the step sizes of the last `n` parameters (BOIL: freeze the head).
    pub fn zero_last(&mut self, n: usize) {
        let len = self.values.len();
        for (_, p) in self.values.named_parameters_mut().skip(len.saturating_sub(n)) {
            p.value.data.iter_mut().for_each(|v| *v = 0.0);
        }
    }

    /// Clamp negative values to zero. Returns the number of values corrected.
    pub fn clamp_non_negative(&mut self) -> usize {
        let mut corrected = 0;
        for (_, p) in self.values.named_parameters_mut() {
            for v in p.value.data.iter_mut() {
                if *v < 0.0 {
                    *v = 0.0;
                    corrected += 1;
                }
            }
        }
        corrected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ParamStore {
        let mut s = ParamStore::new();
        s.insert("layers.0.weight", Tensor::new(vec![1.0, 2.0], vec![1, 2]));
        s.insert("layers.0.bias", Tensor::scalar(0.5));
        s
    }

    #[test]
    fn test_register_preserves_order() {
        let s = store();
        let mut tape = Tape::new();
        let map = s.register(&mut tape);
        let names: Vec<_> = map.keys().cloned().collect();
        assert_eq!(names, vec!["layers.0.weight", "layers.0.bias"]);
        assert!(tape.requires_grad(map.require("layers.0.bias").unwrap()));
    }

    #[test]
    fn test_accumulate_and_zero_grad() {
        let mut s = store();
        s.accumulate_grad("layers.0.weight", &[1.0, 1.0]).unwrap();
        s.accumulate_grad("layers.0.weight", &[0.5, 2.0]).unwrap();
        assert_eq!(s.get("layers.0.weight").unwrap().grad, Some(vec![1.5, 3.0]));
        s.zero_grad();
        assert!(s.get("layers.0.weight").unwrap().grad.is_none());
        assert!(matches!(s.accumulate_grad("nope", &[1.0]), Err(MetaError::MissingParameter(_))));
    }

    #[test]
    fn test_same_keys() {
        let mut a = ParamMap::new();
        a.insert("w", 0);
        a.insert("b", 1);
        let mut b = ParamMap::new();
        b.insert("b", 5);
        b.insert("w", 7);
        assert!(a.same_keys(&b));
        b.insert("extra", 9);
        assert!(a.check_same_keys(&b).is_err());
    }

    #[test]
    fn test_step_size_store_scalar_and_per_param() {
        let s = store();
        let mut tape = Tape::new();
        let scalar = StepSizeStore::scalar(0.1, false).register(&mut tape);
        let id = scalar.for_param("anything").unwrap();
        assert_eq!(tape.data(id), &[0.1]);
        assert!(!tape.requires_grad(id));

        let per = StepSizeStore::per_param(s.names(), 0.2, true).register(&mut tape);
        assert!(per.is_per_param());
        assert!(tape.requires_grad(per.for_param("layers.0.bias").unwrap()));
    }

    #[test]
    fn test_clamp_non_negative_and_zero_last() {
        let s = store();
        let mut steps = StepSizeStore::per_param(s.names(), 0.1, true);
        steps.params_mut().get_mut("layers.0.weight").unwrap().value.data[0] = -0.3;
        assert_eq!(steps.clamp_non_negative(), 1);
        assert_eq!(steps.value("layers.0.weight").unwrap(), 0.0);
        assert_eq!(steps.clamp_non_negative(), 0);

        steps.zero_last(1);
        assert_eq!(steps.value("layers.0.bias").unwrap(), 0.0);
    }
}
