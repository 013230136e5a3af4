/// Gradient verification.
///
/// Provides:
/// - `finite_diff`: central finite difference of a scalar objective with
///   respect to one element of a stored parameter
/// - `check_param_gradient`: compares an analytical gradient against finite
///   differences on a strided sample of elements
///
/// The objective receives a perturbed copy of the store and recomputes the
/// loss from scratch, so it can wrap anything up to a full meta-batch.

use tracing::warn;

use crate::error::{MetaError, Result};
use crate::params::ParamStore;

/// Gradients where both sides are below this magnitude are auto-passed
/// (below finite-difference resolution in f32).
pub const FD_ABS_THRESHOLD: f32 = 5e-4;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GradCheck {
    pub checked: usize,
    pub passed: usize,
    pub max_rel_err: f32,
}

impl GradCheck {
    pub fn all_passed(&self) -> bool {
        self.checked == self.passed
    }
}

fn perturbed(store: &ParamStore, name: &str, idx: usize, delta: f32) -> Result<ParamStore> {
    let mut p = store.clone();
    let param = p.get_mut(name).ok_or_else(|| MetaError::MissingParameter(name.to_string()))?;
    let slot = param.value.data.get_mut(idx).ok_or_else(|| MetaError::ShapeMismatch {
        op: "finite_diff",
        left: param.value.shape.clone(),
        right: vec![idx],
    })?;
    *slot += delta;
    Ok(p)
}

/// `(f(x + eps) - f(x - eps)) / (2 eps)` for element `idx` of `name`.
pub fn finite_diff(
    store: &ParamStore,
    name: &str,
    idx: usize,
    eps: f32,
    mut f: impl FnMut(&ParamStore) -> Result<f32>,
) -> Result<f32> {
    let plus = f(&perturbed(store, name, idx, eps)?)?;
    let minus = f(&perturbed(store, name, idx, -eps)?)?;
    Ok((plus - minus) / (2.0 * eps))
}

/// Check `analytical` (the gradient of `f` w.r.t. `name`) on up to
/// `num_samples` evenly strided elements.
///
/// Relative error uses `max(|a|, |n|)` as denominator. Failures are logged,
/// not returned as errors; inspect the returned counts.
pub fn check_param_gradient(
    store: &ParamStore,
    name: &str,
    analytical: &[f32],
    num_samples: usize,
    eps: f32,
    tol: f32,
    mut f: impl FnMut(&ParamStore) -> Result<f32>,
) -> Result<GradCheck> {
    let n = store.value(name)?.numel();
    if analytical.len() != n {
        return Err(MetaError::ShapeMismatch {
            op: "check_param_gradient",
            left: vec![analytical.len()],
            right: vec![n],
        });
    }

    let stride = if n > num_samples { n / num_samples.max(1) } else { 1 };
    let mut out = GradCheck::default();
    for idx in (0..n).step_by(stride).take(num_samples) {
        let a = analytical[idx];
        let numerical = finite_diff(store, name, idx, eps, &mut f)?;
        out.checked += 1;

        let denom = a.abs().max(numerical.abs());
        if denom < FD_ABS_THRESHOLD {
            out.passed += 1;
            continue;
        }
        let rel_err = (a - numerical).abs() / denom;
        out.max_rel_err = out.max_rel_err.max(rel_err);
        if rel_err < tol {
            out.passed += 1;
        } else {
            warn!(param = name, idx, analytical = a, numerical, rel_err, "gradient check failed");
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn store() -> ParamStore {
        let mut s = ParamStore::new();
        s.insert("w", Tensor::new(vec![1.0, -2.0, 0.5], vec![3]));
        s
    }

    // f(w) = sum w^3, df/dw = 3 w^2
    fn cubic(s: &ParamStore) -> Result<f32> {
        Ok(s.value("w")?.data.iter().map(|x| x * x * x).sum())
    }

    #[test]
    fn test_finite_diff_matches_analytic() {
        let fd = finite_diff(&store(), "w", 1, 1e-2, cubic).unwrap();
        assert!((fd - 12.0).abs() < 1e-2);
    }

    #[test]
    fn test_check_flags_wrong_gradient() {
        let ok = check_param_gradient(&store(), "w", &[3.0, 12.0, 0.75], 3, 1e-2, 1e-2, cubic).unwrap();
        assert!(ok.all_passed());
        assert_eq!(ok.checked, 3);
        let bad = check_param_gradient(&store(), "w", &[3.0, -12.0, 0.75], 3, 1e-2, 1e-2, cubic).unwrap();
        assert_eq!(bad.passed, 2);
        assert!(bad.max_rel_err > 1.0);
    }

    #[test]
    fn test_missing_param() {
        let r = finite_diff(&store(), "nope", 0, 1e-3, cubic);
        assert!(matches!(r, Err(MetaError::MissingParameter(_))));
    }
}
