/// Minimal tensor utilities backing the tape.
///
/// All kernels are free functions on flat f32 slices with explicit dimensions.
/// Row-major layout throughout. Shape checking lives one level up, in the
/// tape ops; these kernels only `debug_assert!` their contracts.

/// Flat f32 tensor with shape metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        assert_eq!(data.len(), shape.iter().product::<usize>(),
                   "Tensor data length {} does not match shape {:?}", data.len(), shape);
        Tensor { data, shape }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Tensor {
            data: vec![0.0; n],
            shape: shape.to_vec(),
        }
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let n: usize = shape.iter().product();
        Tensor {
            data: vec![value; n],
            shape: shape.to_vec(),
        }
    }

    pub fn scalar(value: f32) -> Self {
        Tensor { data: vec![value], shape: vec![1] }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Number of rows along the leading (sample) axis.
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Elements per row (product of trailing dims).
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Gather rows along the leading axis, preserving trailing dims.
    pub fn select_rows(&self, indices: &[usize]) -> Tensor {
        let row_len = self.row_len();
        let mut data = Vec::with_capacity(indices.len() * row_len);
        for &i in indices {
            data.extend_from_slice(&self.data[i * row_len..(i + 1) * row_len]);
        }
        let mut shape = self.shape.clone();
        if shape.is_empty() {
            shape.push(indices.len());
        } else {
            shape[0] = indices.len();
        }
        Tensor { data, shape }
    }

    /// Single row `i` as a batch of one.
    pub fn row(&self, i: usize) -> Tensor {
        self.select_rows(&[i])
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

// ── Free-function math ops on flat slices ────────────────────────────

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N].  Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = sum;
        }
    }
}

/// Transpose A[M,K] → out[K,M].
pub fn transpose_f32(a: &[f32], out: &mut [f32], m: usize, k: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(out.len(), k * m);

    for i in 0..m {
        for j in 0..k {
            out[j * m + i] = a[i * k + j];
        }
    }
}

/// Row-wise softmax: each row of length `cols` in `scores` gets softmaxed into `out`.
pub fn softmax_f32(scores: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(scores.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let row = &scores[base..base + cols];

        // Numerically stable: subtract max
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for c in 0..cols {
            let e = (row[c] - max_val).exp();
            out[base + c] = e;
            sum_exp += e;
        }
        if sum_exp > 0.0 {
            for c in 0..cols {
                out[base + c] /= sum_exp;
            }
        }
    }
}

/// Row-wise log-softmax: out = x - max - ln(sum(exp(x - max))).
pub fn log_softmax_f32(scores: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(scores.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let row = &scores[base..base + cols];
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let sum_exp: f32 = row.iter().map(|v| (v - max_val).exp()).sum();
        let log_z = max_val + sum_exp.ln();
        for c in 0..cols {
            out[base + c] = row[c] - log_z;
        }
    }
}

/// Sigmoid: 1 / (1 + exp(-x)). Clamped to avoid overflow.
#[inline]
pub fn sigmoid_f32(x: f32) -> f32 {
    if x >= 15.0 { return 1.0; }
    if x <= -15.0 { return 0.0; }
    1.0 / (1.0 + (-x).exp())
}

/// Index of the max element in each row. Ties resolve to the first index.
pub fn argmax_rows(a: &[f32], rows: usize, cols: usize) -> Vec<usize> {
    debug_assert_eq!(a.len(), rows * cols);
    (0..rows).map(|r| {
        let row = &a[r * cols..(r + 1) * cols];
        let mut best = 0;
        for c in 1..cols {
            if row[c] > row[best] {
                best = c;
            }
        }
        best
    }).collect()
}

/// L2 norm of a vector: sqrt(sum(a[i]^2)).
pub fn vec_norm_f32(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Simple xorshift64 PRNG for deterministic weight init. Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }
}
