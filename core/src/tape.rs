// Wengert tape: higher-order reverse-mode AD via operation recording.
//
// Records operations during the forward pass into a linear arena, then replays
// them in reverse to compute gradients via the chain rule. Every VJP is itself
// written in tape ops, so a backward pass run with `create_graph = true` is
// recorded like any forward computation and can be differentiated again. This
// is what lets the outer loop see through inner-loop gradient steps.
//
// Invariants:
// - Node order is topological: an op's inputs always have smaller BufIds.
// - A node carries its op iff it requires grad. Detached nodes are leaves.
// - Parameters are snapshotted at registration, immune to later mutation.

use crate::error::{MetaError, Result};
use crate::tensor::{self, Tensor};
use crate::surrogate;

// ── Buffer management ────────────────────────────────────────────────

/// Arena index for tensor buffers. Immutable after creation.
pub type BufId = usize;

/// A flat tensor buffer in the tape arena.
#[derive(Clone, Debug)]
pub struct TapeBuf {
    /// Flat storage (row-major).
    pub data: Vec<f32>,
    /// Shape metadata, e.g., [batch, features].
    pub shape: Vec<usize>,
    /// Whether gradients flow into this buffer.
    pub requires_grad: bool,
    /// True for registered leaves the caller wants gradients for.
    pub is_param: bool,
}

impl TapeBuf {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        TapeBuf { data, shape, requires_grad: false, is_param: false }
    }

    pub fn param(data: Vec<f32>, shape: Vec<usize>) -> Self {
        TapeBuf { data, shape, requires_grad: true, is_param: true }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ── Tape operations ──────────────────────────────────────────────────

/// A single recorded operation. The output is the node that owns the op.
#[derive(Debug, Clone)]
pub enum TapeOp {
    // ── Element-wise ────────────────────────────────────────────
    /// out = A + B
    Add { a: BufId, b: BufId },
    /// out = A - B
    Sub { a: BufId, b: BufId },
    /// out = A * B  (element-wise)
    Mul { a: BufId, b: BufId },
    /// out = -A
    Negate { input: BufId },
    /// out = scalar * A  (scalar is a constant)
    Scale { input: BufId, scalar: f32 },
    /// out = A + c
    AddConst { input: BufId },
    /// out = s * A  (s is a one-element node, e.g. a learned step size)
    ScaleBy { scalar: BufId, input: BufId },
    /// out = |A|
    Abs { input: BufId },
    /// out = 1 / A
    Recip { input: BufId },

    // ── Linear algebra ──────────────────────────────────────────
    /// out = A @ B where A: [m, k], B: [k, n]
    Matmul { a: BufId, b: BufId },
    /// out = A^T where A: [rows, cols]
    Transpose { input: BufId },
    /// out[i, j] = X[i, j] + b[j]
    AddRowBias { x: BufId, bias: BufId },

    // ── Reductions / broadcasts ─────────────────────────────────
    /// [m, n] → [n]
    SumAxis0 { input: BufId, rows: usize },
    /// [m, n] → [m]
    SumAxis1 { input: BufId, cols: usize },
    /// [n] → [rows, n]
    BroadcastAxis0 { input: BufId },
    /// [m] → [m, cols]
    BroadcastAxis1 { input: BufId },
    /// any → [1]
    Sum { input: BufId },
    /// [1] → shape
    Expand { input: BufId },
    /// same data, new shape
    Reshape { input: BufId },
    /// out = X[:, offset..offset+len]
    SliceCols { input: BufId, offset: usize, total: usize },
    /// out[:, offset..offset+len] = X, zeros elsewhere
    PadCols { input: BufId, offset: usize, len: usize },

    // ── Activations ─────────────────────────────────────────────
    /// out = sigmoid(x); backward reads the saved output
    Sigmoid { input: BufId },
    /// out = max(x, 0)
    Relu { input: BufId },
    /// out = softmax(x) per-row; x: [rows, cols]
    SoftmaxRows { input: BufId },
    /// out = log_softmax(x) per-row; x: [rows, cols]
    LogSoftmaxRows { input: BufId },
    /// out = clamp(x, min, max); gradient masked outside the range
    Clamp { input: BufId, min: f32, max: f32 },
    /// Forward value supplied by the caller, gradient passes through unchanged
    StraightThrough { input: BufId },

    // ── Surrogate-gradient functions ────────────────────────────
    /// out = 1[x > th]; backward g / (10|x| + 1)^2
    FastSigmoid { input: BufId, threshold: Vec<f32> },
    /// out = x * (1[x > th] + 1[x < -th]); backward returns the gate mask
    ThresholdSurrogate { input: BufId, threshold: Vec<f32> },
}

impl TapeOp {
    /// Input buffers of this op, in a fixed order.
    pub fn inputs(&self) -> Vec<BufId> {
        match self {
            TapeOp::Add { a, b } | TapeOp::Sub { a, b } | TapeOp::Mul { a, b }
            | TapeOp::Matmul { a, b } => vec![*a, *b],
            TapeOp::ScaleBy { scalar, input } => vec![*scalar, *input],
            TapeOp::AddRowBias { x, bias } => vec![*x, *bias],
            TapeOp::Negate { input }
            | TapeOp::Scale { input, .. }
            | TapeOp::AddConst { input }
            | TapeOp::Abs { input }
            | TapeOp::Recip { input }
            | TapeOp::Transpose { input }
            | TapeOp::SumAxis0 { input, .. }
            | TapeOp::SumAxis1 { input, .. }
            | TapeOp::BroadcastAxis0 { input }
            | TapeOp::BroadcastAxis1 { input }
            | TapeOp::Sum { input }
            | TapeOp::Expand { input }
            | TapeOp::Reshape { input }
            | TapeOp::SliceCols { input, .. }
            | TapeOp::PadCols { input, .. }
            | TapeOp::Sigmoid { input }
            | TapeOp::Relu { input }
            | TapeOp::SoftmaxRows { input }
            | TapeOp::LogSoftmaxRows { input }
            | TapeOp::Clamp { input, .. }
            | TapeOp::StraightThrough { input }
            | TapeOp::FastSigmoid { input, .. }
            | TapeOp::ThresholdSurrogate { input, .. } => vec![*input],
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    buf: TapeBuf,
    op: Option<TapeOp>,
}

// ── The Tape ─────────────────────────────────────────────────────────

/// Wengert tape for higher-order reverse-mode AD.
///
/// One tape per outer-loop batch: the meta-parameters are registered as
/// leaves, every inner-loop step appends to the same arena, and the tape is
/// dropped once the outer gradient has been read out.
pub struct Tape {
    nodes: Vec<Node>,
    /// When false, ops compute values but record nothing (detached outputs).
    grad_enabled: bool,
}

impl Default for Tape {
    fn default() -> Self {
        Tape::new()
    }
}

impl Tape {
    pub fn new() -> Self {
        Tape { nodes: Vec::new(), grad_enabled: true }
    }

    // ── Leaves ───────────────────────────────────────────────────

    /// Register a trainable leaf. CLONES the data (snapshot semantics).
    pub fn param(&mut self, data: &[f32], shape: Vec<usize>) -> BufId {
        self.push_leaf(TapeBuf::param(data.to_vec(), shape))
    }

    /// Non-differentiable input buffer.
    pub fn constant(&mut self, data: Vec<f32>, shape: Vec<usize>) -> BufId {
        self.push_leaf(TapeBuf::new(data, shape))
    }

    /// Leaf with an explicit requires-grad flag (e.g. a fixed vs learned step size).
    pub fn leaf(&mut self, data: Vec<f32>, shape: Vec<usize>, requires_grad: bool) -> BufId {
        let mut buf = TapeBuf::new(data, shape);
        buf.requires_grad = requires_grad;
        buf.is_param = requires_grad;
        self.push_leaf(buf)
    }

    pub fn tensor(&mut self, t: &Tensor) -> BufId {
        self.constant(t.data.clone(), t.shape.clone())
    }

    /// Non-differentiable copy of a buffer.
    pub fn detach(&mut self, id: BufId) -> BufId {
        let buf = &self.nodes[id].buf;
        let (data, shape) = (buf.data.clone(), buf.shape.clone());
        self.constant(data, shape)
    }

    fn push_leaf(&mut self, buf: TapeBuf) -> BufId {
        assert_eq!(buf.data.len(), buf.shape.iter().product::<usize>(),
                   "leaf data length {} does not match shape {:?}", buf.data.len(), buf.shape);
        let id = self.nodes.len();
        self.nodes.push(Node { buf, op: None });
        id
    }

    /// Append an op output. Records the op only when grad mode is on and some
    /// input requires grad; otherwise the output is a detached leaf.
    fn push(&mut self, data: Vec<f32>, shape: Vec<usize>, op: TapeOp) -> BufId {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        let requires_grad = self.grad_enabled
            && op.inputs().iter().any(|&i| self.nodes[i].buf.requires_grad);
        let id = self.nodes.len();
        let mut buf = TapeBuf::new(data, shape);
        buf.requires_grad = requires_grad;
        self.nodes.push(Node { buf, op: if requires_grad { Some(op) } else { None } });
        id
    }

    // ── Access ───────────────────────────────────────────────────

    pub fn data(&self, id: BufId) -> &[f32] {
        &self.nodes[id].buf.data
    }

    pub fn shape(&self, id: BufId) -> &[usize] {
        &self.nodes[id].buf.shape
    }

    pub fn numel(&self, id: BufId) -> usize {
        self.nodes[id].buf.numel()
    }

    pub fn requires_grad(&self, id: BufId) -> bool {
        self.nodes[id].buf.requires_grad
    }

    pub fn is_param(&self, id: BufId) -> bool {
        self.nodes[id].buf.is_param
    }

    /// First element; callers use it on one-element buffers.
    pub fn scalar(&self, id: BufId) -> f32 {
        self.nodes[id].buf.data[0]
    }

    pub fn to_tensor(&self, id: BufId) -> Tensor {
        let buf = &self.nodes[id].buf;
        Tensor { data: buf.data.clone(), shape: buf.shape.clone() }
    }

    pub fn num_bufs(&self) -> usize {
        self.nodes.len()
    }

    /// Number of recorded (differentiable) ops.
    pub fn num_ops(&self) -> usize {
        self.nodes.iter().filter(|n| n.op.is_some()).count()
    }

    // ── Grad mode ────────────────────────────────────────────────

    pub fn grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    /// Set grad mode, returning the previous value.
    pub fn set_grad_enabled(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.grad_enabled, enabled)
    }

    /// Run `f` with recording disabled. Outputs produced inside are detached.
    pub fn no_grad<R>(&mut self, f: impl FnOnce(&mut Tape) -> R) -> R {
        let prev = self.set_grad_enabled(false);
        let out = f(self);
        self.set_grad_enabled(prev);
        out
    }

    // ── Shape helpers ────────────────────────────────────────────

    fn same_shape(&self, op: &'static str, a: BufId, b: BufId) -> Result<()> {
        if self.shape(a) != self.shape(b) {
            return Err(MetaError::ShapeMismatch {
                op,
                left: self.shape(a).to_vec(),
                right: self.shape(b).to_vec(),
            });
        }
        Ok(())
    }

    fn dims2(&self, op: &'static str, id: BufId) -> Result<(usize, usize)> {
        match *self.shape(id) {
            [r, c] => Ok((r, c)),
            ref other => Err(MetaError::ShapeMismatch { op, left: other.to_vec(), right: vec![0, 0] }),
        }
    }

    fn dims1(&self, op: &'static str, id: BufId) -> Result<usize> {
        match *self.shape(id) {
            [n] => Ok(n),
            ref other => Err(MetaError::ShapeMismatch { op, left: other.to_vec(), right: vec![0] }),
        }
    }

    fn zip_map(&self, a: BufId, b: BufId, f: impl Fn(f32, f32) -> f32) -> Vec<f32> {
        self.data(a).iter().zip(self.data(b).iter()).map(|(&x, &y)| f(x, y)).collect()
    }

    fn map(&self, a: BufId, f: impl Fn(f32) -> f32) -> Vec<f32> {
        self.data(a).iter().map(|&x| f(x)).collect()
    }

    // ── Element-wise ops ─────────────────────────────────────────

    pub fn add(&mut self, a: BufId, b: BufId) -> Result<BufId> {
        self.same_shape("add", a, b)?;
        let data = self.zip_map(a, b, |x, y| x + y);
        let shape = self.shape(a).to_vec();
        Ok(self.push(data, shape, TapeOp::Add { a, b }))
    }

    pub fn sub(&mut self, a: BufId, b: BufId) -> Result<BufId> {
        self.same_shape("sub", a, b)?;
        let data = self.zip_map(a, b, |x, y| x - y);
        let shape = self.shape(a).to_vec();
        Ok(self.push(data, shape, TapeOp::Sub { a, b }))
    }

    pub fn mul(&mut self, a: BufId, b: BufId) -> Result<BufId> {
        self.same_shape("mul", a, b)?;
        let data = self.zip_map(a, b, |x, y| x * y);
        let shape = self.shape(a).to_vec();
        Ok(self.push(data, shape, TapeOp::Mul { a, b }))
    }

    pub fn neg(&mut self, input: BufId) -> BufId {
        let data = self.map(input, |x| -x);
        let shape = self.shape(input).to_vec();
        self.push(data, shape, TapeOp::Negate { input })
    }

    pub fn scale(&mut self, input: BufId, scalar: f32) -> BufId {
        let data = self.map(input, |x| scalar * x);
        let shape = self.shape(input).to_vec();
        self.push(data, shape, TapeOp::Scale { input, scalar })
    }

    pub fn add_const(&mut self, input: BufId, c: f32) -> BufId {
        let data = self.map(input, |x| x + c);
        let shape = self.shape(input).to_vec();
        self.push(data, shape, TapeOp::AddConst { input })
    }

    pub fn abs(&mut self, input: BufId) -> BufId {
        let data = self.map(input, f32::abs);
        let shape = self.shape(input).to_vec();
        self.push(data, shape, TapeOp::Abs { input })
    }

    pub fn recip(&mut self, input: BufId) -> BufId {
        let data = self.map(input, f32::recip);
        let shape = self.shape(input).to_vec();
        self.push(data, shape, TapeOp::Recip { input })
    }

    /// out = s * input, where `s` is a one-element buffer.
    pub fn scale_by(&mut self, scalar: BufId, input: BufId) -> Result<BufId> {
        if self.numel(scalar) != 1 {
            return Err(MetaError::NonScalar { op: "scale_by", shape: self.shape(scalar).to_vec() });
        }
        let s = self.scalar(scalar);
        let data = self.map(input, |x| s * x);
        let shape = self.shape(input).to_vec();
        Ok(self.push(data, shape, TapeOp::ScaleBy { scalar, input }))
    }

    // ── Linear algebra ───────────────────────────────────────────

    pub fn matmul(&mut self, a: BufId, b: BufId) -> Result<BufId> {
        let (m, k) = self.dims2("matmul", a)?;
        let (k2, n) = self.dims2("matmul", b)?;
        if k != k2 {
            return Err(MetaError::ShapeMismatch {
                op: "matmul",
                left: self.shape(a).to_vec(),
                right: self.shape(b).to_vec(),
            });
        }
        let mut out = vec![0.0f32; m * n];
        tensor::matmul_f32(self.data(a), self.data(b), &mut out, m, k, n);
        Ok(self.push(out, vec![m, n], TapeOp::Matmul { a, b }))
    }

    pub fn transpose(&mut self, input: BufId) -> Result<BufId> {
        let (rows, cols) = self.dims2("transpose", input)?;
        let mut out = vec![0.0f32; rows * cols];
        tensor::transpose_f32(self.data(input), &mut out, rows, cols);
        Ok(self.push(out, vec![cols, rows], TapeOp::Transpose { input }))
    }

    pub fn add_row_bias(&mut self, x: BufId, bias: BufId) -> Result<BufId> {
        let (m, n) = self.dims2("add_row_bias", x)?;
        let nb = self.dims1("add_row_bias", bias)?;
        if nb != n {
            return Err(MetaError::ShapeMismatch {
                op: "add_row_bias",
                left: self.shape(x).to_vec(),
                right: self.shape(bias).to_vec(),
            });
        }
        let (xd, bd) = (self.data(x), self.data(bias));
        let data: Vec<f32> = (0..m * n).map(|i| xd[i] + bd[i % n]).collect();
        Ok(self.push(data, vec![m, n], TapeOp::AddRowBias { x, bias }))
    }

    // ── Reductions / broadcasts ──────────────────────────────────

    pub fn sum_axis0(&mut self, input: BufId) -> Result<BufId> {
        let (rows, cols) = self.dims2("sum_axis0", input)?;
        let d = self.data(input);
        let mut out = vec![0.0f32; cols];
        for r in 0..rows {
            for c in 0..cols {
                out[c] += d[r * cols + c];
            }
        }
        Ok(self.push(out, vec![cols], TapeOp::SumAxis0 { input, rows }))
    }

    pub fn sum_axis1(&mut self, input: BufId) -> Result<BufId> {
        let (rows, cols) = self.dims2("sum_axis1", input)?;
        let d = self.data(input);
        let out: Vec<f32> = (0..rows).map(|r| d[r * cols..(r + 1) * cols].iter().sum()).collect();
        Ok(self.push(out, vec![rows], TapeOp::SumAxis1 { input, cols }))
    }

    pub fn broadcast_axis0(&mut self, input: BufId, rows: usize) -> Result<BufId> {
        let n = self.dims1("broadcast_axis0", input)?;
        let d = self.data(input);
        let out: Vec<f32> = (0..rows * n).map(|i| d[i % n]).collect();
        Ok(self.push(out, vec![rows, n], TapeOp::BroadcastAxis0 { input }))
    }

    pub fn broadcast_axis1(&mut self, input: BufId, cols: usize) -> Result<BufId> {
        let m = self.dims1("broadcast_axis1", input)?;
        let d = self.data(input);
        let out: Vec<f32> = (0..m * cols).map(|i| d[i / cols]).collect();
        Ok(self.push(out, vec![m, cols], TapeOp::BroadcastAxis1 { input }))
    }

    pub fn sum(&mut self, input: BufId) -> BufId {
        let s: f32 = self.data(input).iter().sum();
        self.push(vec![s], vec![1], TapeOp::Sum { input })
    }

    pub fn mean(&mut self, input: BufId) -> BufId {
        let n = self.numel(input).max(1) as f32;
        let s = self.sum(input);
        self.scale(s, 1.0 / n)
    }

    pub fn expand(&mut self, input: BufId, shape: Vec<usize>) -> Result<BufId> {
        if self.numel(input) != 1 {
            return Err(MetaError::NonScalar { op: "expand", shape: self.shape(input).to_vec() });
        }
        let v = self.scalar(input);
        let n: usize = shape.iter().product();
        Ok(self.push(vec![v; n], shape, TapeOp::Expand { input }))
    }

    pub fn reshape(&mut self, input: BufId, shape: Vec<usize>) -> Result<BufId> {
        if self.numel(input) != shape.iter().product::<usize>() {
            return Err(MetaError::ShapeMismatch { op: "reshape", left: self.shape(input).to_vec(), right: shape });
        }
        if self.shape(input) == shape.as_slice() {
            return Ok(input);
        }
        let data = self.data(input).to_vec();
        Ok(self.push(data, shape, TapeOp::Reshape { input }))
    }

    pub fn slice_cols(&mut self, input: BufId, offset: usize, len: usize) -> Result<BufId> {
        let (rows, total) = self.dims2("slice_cols", input)?;
        if offset + len > total {
            return Err(MetaError::ShapeMismatch { op: "slice_cols", left: vec![rows, total], right: vec![rows, offset + len] });
        }
        let d = self.data(input);
        let mut out = Vec::with_capacity(rows * len);
        for r in 0..rows {
            out.extend_from_slice(&d[r * total + offset..r * total + offset + len]);
        }
        Ok(self.push(out, vec![rows, len], TapeOp::SliceCols { input, offset, total }))
    }

    pub fn pad_cols(&mut self, input: BufId, offset: usize, total: usize) -> Result<BufId> {
        let (rows, len) = self.dims2("pad_cols", input)?;
        if offset + len > total {
            return Err(MetaError::ShapeMismatch { op: "pad_cols", left: vec![rows, len], right: vec![rows, total] });
        }
        let d = self.data(input);
        let mut out = vec![0.0f32; rows * total];
        for r in 0..rows {
            out[r * total + offset..r * total + offset + len].copy_from_slice(&d[r * len..(r + 1) * len]);
        }
        Ok(self.push(out, vec![rows, total], TapeOp::PadCols { input, offset, len }))
    }

    // ── Activations ──────────────────────────────────────────────

    pub fn sigmoid(&mut self, input: BufId) -> BufId {
        let data = self.map(input, tensor::sigmoid_f32);
        let shape = self.shape(input).to_vec();
        self.push(data, shape, TapeOp::Sigmoid { input })
    }

    pub fn relu(&mut self, input: BufId) -> BufId {
        let data = self.map(input, |x| x.max(0.0));
        let shape = self.shape(input).to_vec();
        self.push(data, shape, TapeOp::Relu { input })
    }

    pub fn softmax_rows(&mut self, input: BufId) -> Result<BufId> {
        let (rows, cols) = self.dims2("softmax_rows", input)?;
        let mut out = vec![0.0f32; rows * cols];
        tensor::softmax_f32(self.data(input), &mut out, rows, cols);
        Ok(self.push(out, vec![rows, cols], TapeOp::SoftmaxRows { input }))
    }

    pub fn log_softmax_rows(&mut self, input: BufId) -> Result<BufId> {
        let (rows, cols) = self.dims2("log_softmax_rows", input)?;
        let mut out = vec![0.0f32; rows * cols];
        tensor::log_softmax_f32(self.data(input), &mut out, rows, cols);
        Ok(self.push(out, vec![rows, cols], TapeOp::LogSoftmaxRows { input }))
    }

    pub fn clamp(&mut self, input: BufId, min: f32, max: f32) -> BufId {
        let data = self.map(input, |x| x.clamp(min, max));
        let shape = self.shape(input).to_vec();
        self.push(data, shape, TapeOp::Clamp { input, min, max })
    }

    /// Forward takes `values`, backward is the identity (straight-through estimator).
    pub fn straight_through(&mut self, input: BufId, values: Vec<f32>) -> Result<BufId> {
        if values.len() != self.numel(input) {
            return Err(MetaError::ShapeMismatch {
                op: "straight_through",
                left: self.shape(input).to_vec(),
                right: vec![values.len()],
            });
        }
        let shape = self.shape(input).to_vec();
        Ok(self.push(values, shape, TapeOp::StraightThrough { input }))
    }

    // ── Surrogate-gradient functions ─────────────────────────────

    pub fn fast_sigmoid(&mut self, input: BufId, threshold: &[f32]) -> Result<BufId> {
        let data = surrogate::fast_sigmoid_forward(self.data(input), threshold)
            .ok_or_else(|| self.threshold_mismatch("fast_sigmoid", input, threshold))?;
        let shape = self.shape(input).to_vec();
        Ok(self.push(data, shape, TapeOp::FastSigmoid { input, threshold: threshold.to_vec() }))
    }

    pub fn threshold_surrogate(&mut self, input: BufId, threshold: &[f32]) -> Result<BufId> {
        let data = surrogate::threshold_surrogate_forward(self.data(input), threshold)
            .ok_or_else(|| self.threshold_mismatch("threshold_surrogate", input, threshold))?;
        let shape = self.shape(input).to_vec();
        Ok(self.push(data, shape, TapeOp::ThresholdSurrogate { input, threshold: threshold.to_vec() }))
    }

    fn threshold_mismatch(&self, op: &'static str, input: BufId, threshold: &[f32]) -> MetaError {
        MetaError::ShapeMismatch { op, left: self.shape(input).to_vec(), right: vec![threshold.len()] }
    }

    // ── Backward pass ────────────────────────────────────────────

    /// Vector-Jacobian product of `output` with respect to each of `wrt`.
    ///
    /// `seed` is the upstream gradient (same numel as `output`); `None` seeds a
    /// scalar output with 1.0. Entries of the result are `None` for buffers the
    /// output does not depend on. With `create_graph` the backward ops are
    /// recorded and the returned gradients stay differentiable; otherwise they
    /// are detached leaves.
    pub fn grad(
        &mut self,
        output: BufId,
        seed: Option<BufId>,
        wrt: &[BufId],
        create_graph: bool,
    ) -> Result<Vec<Option<BufId>>> {
        let seed = match seed {
            Some(s) => {
                if self.numel(s) != self.numel(output) {
                    return Err(MetaError::ShapeMismatch {
                        op: "grad seed",
                        left: self.shape(output).to_vec(),
                        right: self.shape(s).to_vec(),
                    });
                }
                s
            }
            None => {
                if self.numel(output) != 1 {
                    return Err(MetaError::NonScalar { op: "grad", shape: self.shape(output).to_vec() });
                }
                let shape = self.shape(output).to_vec();
                self.constant(vec![1.0], shape)
            }
        };

        let prev = self.set_grad_enabled(create_graph);
        let result = self.backward_from(output, seed, wrt);
        self.set_grad_enabled(prev);
        let grads = result?;

        if create_graph {
            return Ok(grads);
        }
        Ok(grads.into_iter()
            .map(|g| g.map(|id| if self.requires_grad(id) { self.detach(id) } else { id }))
            .collect())
    }

    fn backward_from(&mut self, output: BufId, seed: BufId, wrt: &[BufId]) -> Result<Vec<Option<BufId>>> {
        let mut grads: Vec<Option<BufId>> = vec![None; output + 1];
        grads[output] = Some(seed);

        for id in (0..=output).rev() {
            let Some(g) = grads[id] else { continue };
            let Some(op) = self.nodes[id].op.clone() else { continue };
            for (input, d_input) in self.vjp(&op, id, g)? {
                if !self.requires_grad(input) {
                    continue;
                }
                grads[input] = Some(match grads[input] {
                    Some(existing) => self.add(existing, d_input)?,
                    None => d_input,
                });
            }
        }

        Ok(wrt.iter().map(|&w| grads.get(w).copied().flatten()).collect())
    }

    /// Constant built from a per-element function of a buffer's data.
    fn mask_of(&mut self, id: BufId, f: impl Fn(f32) -> f32) -> BufId {
        let data = self.map(id, f);
        let shape = self.shape(id).to_vec();
        self.constant(data, shape)
    }

    /// VJP for a single op. Returns (input, gradient) pairs, skipping inputs
    /// that do not require grad. `out` is the op's own output node.
    fn vjp(&mut self, op: &TapeOp, out: BufId, g: BufId) -> Result<Vec<(BufId, BufId)>> {
        let mut contribs = Vec::with_capacity(2);
        match op {
            TapeOp::Add { a, b } => {
                contribs.push((*a, g));
                contribs.push((*b, g));
            }
            TapeOp::Sub { a, b } => {
                contribs.push((*a, g));
                if self.requires_grad(*b) {
                    contribs.push((*b, self.neg(g)));
                }
            }
            TapeOp::Mul { a, b } => {
                if self.requires_grad(*a) {
                    contribs.push((*a, self.mul(g, *b)?));
                }
                if self.requires_grad(*b) {
                    contribs.push((*b, self.mul(g, *a)?));
                }
            }
            TapeOp::Negate { input } => contribs.push((*input, self.neg(g))),
            TapeOp::Scale { input, scalar } => contribs.push((*input, self.scale(g, *scalar))),
            TapeOp::AddConst { input } => contribs.push((*input, g)),
            TapeOp::Abs { input } => {
                // sign(0) = 0
                let sign = self.mask_of(*input, |x| if x > 0.0 { 1.0 } else if x < 0.0 { -1.0 } else { 0.0 });
                contribs.push((*input, self.mul(g, sign)?));
            }
            TapeOp::Recip { input } => {
                // d_x = -d_out * y^2, y = out
                let y2 = self.mul(out, out)?;
                let gy2 = self.mul(g, y2)?;
                contribs.push((*input, self.neg(gy2)));
            }
            TapeOp::ScaleBy { scalar, input } => {
                if self.requires_grad(*input) {
                    contribs.push((*input, self.scale_by(*scalar, g)?));
                }
                if self.requires_grad(*scalar) {
                    let prod = self.mul(g, *input)?;
                    let s = self.sum(prod);
                    let shape = self.shape(*scalar).to_vec();
                    contribs.push((*scalar, self.reshape(s, shape)?));
                }
            }
            TapeOp::Matmul { a, b } => {
                // d_A = d_out @ B^T, d_B = A^T @ d_out
                if self.requires_grad(*a) {
                    let b_t = self.transpose(*b)?;
                    contribs.push((*a, self.matmul(g, b_t)?));
                }
                if self.requires_grad(*b) {
                    let a_t = self.transpose(*a)?;
                    contribs.push((*b, self.matmul(a_t, g)?));
                }
            }
            TapeOp::Transpose { input } => contribs.push((*input, self.transpose(g)?)),
            TapeOp::AddRowBias { x, bias } => {
                contribs.push((*x, g));
                if self.requires_grad(*bias) {
                    contribs.push((*bias, self.sum_axis0(g)?));
                }
            }
            TapeOp::SumAxis0 { input, rows } => contribs.push((*input, self.broadcast_axis0(g, *rows)?)),
            TapeOp::SumAxis1 { input, cols } => contribs.push((*input, self.broadcast_axis1(g, *cols)?)),
            TapeOp::BroadcastAxis0 { input } => contribs.push((*input, self.sum_axis0(g)?)),
            TapeOp::BroadcastAxis1 { input } => contribs.push((*input, self.sum_axis1(g)?)),
            TapeOp::Sum { input } => {
                let shape = self.shape(*input).to_vec();
                contribs.push((*input, self.expand(g, shape)?));
            }
            TapeOp::Expand { input } => {
                let s = self.sum(g);
                let shape = self.shape(*input).to_vec();
                contribs.push((*input, self.reshape(s, shape)?));
            }
            TapeOp::Reshape { input } => {
                let shape = self.shape(*input).to_vec();
                contribs.push((*input, self.reshape(g, shape)?));
            }
            TapeOp::SliceCols { input, offset, total } => {
                contribs.push((*input, self.pad_cols(g, *offset, *total)?));
            }
            TapeOp::PadCols { input, offset, len } => {
                contribs.push((*input, self.slice_cols(g, *offset, *len)?));
            }
            TapeOp::Sigmoid { .. } => {
                // d_x = d_out * y * (1 - y), y = out
                let input = op.inputs()[0];
                let neg_y = self.neg(out);
                let one_minus = self.add_const(neg_y, 1.0);
                let dy = self.mul(out, one_minus)?;
                contribs.push((input, self.mul(g, dy)?));
            }
            TapeOp::Relu { input } => {
                let mask = self.mask_of(*input, |x| if x > 0.0 { 1.0 } else { 0.0 });
                contribs.push((*input, self.mul(g, mask)?));
            }
            TapeOp::SoftmaxRows { input } => {
                // d_x = y * (d_out - rowsum(d_out * y))
                let (_, cols) = self.dims2("softmax_rows", out)?;
                let gy = self.mul(g, out)?;
                let s = self.sum_axis1(gy)?;
                let sb = self.broadcast_axis1(s, cols)?;
                let ysb = self.mul(out, sb)?;
                contribs.push((*input, self.sub(gy, ysb)?));
            }
            TapeOp::LogSoftmaxRows { input } => {
                // d_x = d_out - softmax(x) * rowsum(d_out)
                let (_, cols) = self.dims2("log_softmax_rows", out)?;
                let p = self.softmax_rows(*input)?;
                let s = self.sum_axis1(g)?;
                let sb = self.broadcast_axis1(s, cols)?;
                let psb = self.mul(p, sb)?;
                contribs.push((*input, self.sub(g, psb)?));
            }
            TapeOp::Clamp { input, min, max } => {
                let (lo, hi) = (*min, *max);
                let mask = self.mask_of(*input, |x| if x >= lo && x <= hi { 1.0 } else { 0.0 });
                contribs.push((*input, self.mul(g, mask)?));
            }
            TapeOp::StraightThrough { input } => contribs.push((*input, g)),
            TapeOp::FastSigmoid { input, .. } => {
                // g / (10|x| + 1)^2, recorded on x so the factor is differentiable
                let ax = self.abs(*input);
                let scaled = self.scale(ax, surrogate::SURROGATE_SLOPE);
                let d = self.add_const(scaled, 1.0);
                let d2 = self.mul(d, d)?;
                let factor = self.recip(d2);
                contribs.push((*input, self.mul(g, factor)?));
            }
            TapeOp::ThresholdSurrogate { input, threshold } => {
                // Upstream gradient is discarded: the gate mask IS the gradient.
                let mask = surrogate::threshold_gate(self.data(*input), threshold)
                    .ok_or_else(|| self.threshold_mismatch("threshold_surrogate", *input, threshold))?;
                let shape = self.shape(*input).to_vec();
                contribs.push((*input, self.constant(mask, shape)));
            }
        }
        Ok(contribs)
    }
}
