// stage.rs — One layer of the inference pipeline.
//
// The four layer kinds of a LeNet-style network are fixed and known at
// compile time, so a stage is a closed enum tag plus a shared payload
// (shapes, weights, biases). Dispatch is a `match` on the tag; there is no
// trait object per layer kind.
//
//   Kind          Output                                          Weights      Biases
//   ───────────   ──────────────────────────────────────────────  ───────────  ──────
//   Conv          σ(Σ_i Σ_xy w[o,i,x,y]·in[i,r+x,c+y] + b[o])     oD·iD·k²     oD
//   Pool(Sum)     σ(w[o]·Σ_xy in[o,r·k+x,c·k+y] + b[o])           oD           oD
//   Pool(Max)     max_xy in[o,r·k+x,c·k+y]                        —            —
//   FullConnect   σ(Σ_i w[o,i]·in[i] + b[o])                      out·in       out
//   Distance      Σ_i (w[o,i] − in[i])²                           out·in       —
//
// `compute_cpu` is the authoritative reference implementation. Every device
// backend is validated against it (see check.rs); the tolerance is 1e-4.
//
// A stage is immutable once built. Its position in the pipeline (first /
// last) is stamped by `Pipeline::new` and only decides which buffers the
// stage reads and writes; it never changes the arithmetic.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::{BufferRange, Device, Dispatch, WorkShape};
use crate::error::{ConfigError, DeviceError};
use crate::shape::Shape;
use crate::token_pool::WorkItem;

/// Logistic activation, `1 / (1 + e^-x)`.
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Pooling reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// Scaled window sum followed by the logistic activation (LeNet-5 style).
    Sum,
    /// Plain window maximum, no activation.
    Max,
}

/// Closed set of layer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Conv,
    Pool(PoolMode),
    FullConnect,
    Distance,
}

impl StageKind {
    /// Default compute entry point for this kind.
    pub fn entry_point(&self) -> &'static str {
        match self {
            StageKind::Conv => "conv_forward",
            StageKind::Pool(_) => "pool_forward",
            StageKind::FullConnect => "full_forward",
            StageKind::Distance => "distance_forward",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Conv => write!(f, "conv"),
            StageKind::Pool(PoolMode::Sum) => write!(f, "pool(sum)"),
            StageKind::Pool(PoolMode::Max) => write!(f, "pool(max)"),
            StageKind::FullConnect => write!(f, "full"),
            StageKind::Distance => write!(f, "distance"),
        }
    }
}

/// One pipeline stage: shape metadata, parameters, and kernel identity.
#[derive(Debug, Clone)]
pub struct Stage {
    name: String,
    kind: StageKind,
    input: Shape,
    output: Shape,
    kernel_size: usize,
    weights: Arc<[f32]>,
    biases: Arc<[f32]>,
    kernel: String,
    work_group: Option<[u32; 2]>,
    pub(crate) first: bool,
    pub(crate) last: bool,
}

impl Stage {
    // --- Constructors -------------------------------------------------------

    /// Convolution with a `kernel_size × kernel_size` window, no padding,
    /// stride 1.
    pub fn conv(
        name: impl Into<String>,
        input: Shape,
        kernel_size: usize,
        out_depth: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if kernel_size == 0 || kernel_size > input.width || kernel_size > input.height {
            return Err(ConfigError::InvalidStage {
                reason: format!("kernel size {kernel_size} does not fit input {input}"),
                name,
            });
        }
        let output = Shape::new(
            input.width - kernel_size + 1,
            input.height - kernel_size + 1,
            out_depth,
        );
        let expected = out_depth * input.depth * kernel_size * kernel_size;
        Self::build(
            name,
            StageKind::Conv,
            input,
            output,
            kernel_size,
            weights,
            biases,
            expected,
            out_depth,
        )
    }

    /// Non-overlapping pooling with a `kernel_size × kernel_size` window.
    /// The input width and height must be multiples of the window.
    pub fn pool(
        name: impl Into<String>,
        input: Shape,
        kernel_size: usize,
        mode: PoolMode,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if kernel_size == 0
            || input.width % kernel_size != 0
            || input.height % kernel_size != 0
        {
            return Err(ConfigError::InvalidStage {
                reason: format!("pool window {kernel_size} does not divide input {input}"),
                name,
            });
        }
        let output = Shape::new(input.width / kernel_size, input.height / kernel_size, input.depth);
        let per_map = match mode {
            PoolMode::Sum => input.depth,
            PoolMode::Max => 0,
        };
        Self::build(
            name,
            StageKind::Pool(mode),
            input,
            output,
            kernel_size,
            weights,
            biases,
            per_map,
            per_map,
        )
    }

    /// Dense layer: every output sees every input.
    pub fn full_connect(
        name: impl Into<String>,
        input: Shape,
        outputs: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Result<Self, ConfigError> {
        let expected = outputs * input.len();
        Self::build(
            name.into(), StageKind::FullConnect, input, Shape::flat(outputs), 1,
            weights, biases, expected, outputs,
        )
    }

    /// Euclidean RBF output layer: squared distance to each weight row.
    pub fn distance(
        name: impl Into<String>,
        input: Shape,
        outputs: usize,
        weights: Vec<f32>,
    ) -> Result<Self, ConfigError> {
        let expected = outputs * input.len();
        Self::build(
            name.into(), StageKind::Distance, input, Shape::flat(outputs), 1,
            weights, Vec::new(), expected, 0,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        name: String,
        kind: StageKind,
        input: Shape,
        output: Shape,
        kernel_size: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
        expected_weights: usize,
        expected_biases: usize,
    ) -> Result<Self, ConfigError> {
        if input.is_empty() || output.is_empty() {
            return Err(ConfigError::InvalidStage {
                reason: format!("empty volume ({input} → {output})"),
                name,
            });
        }
        if weights.len() != expected_weights {
            return Err(ConfigError::ParameterCount {
                name,
                what: "weights",
                expected: expected_weights,
                actual: weights.len(),
            });
        }
        if biases.len() != expected_biases {
            return Err(ConfigError::ParameterCount {
                name,
                what: "biases",
                expected: expected_biases,
                actual: biases.len(),
            });
        }
        Ok(Stage {
            kernel: kind.entry_point().to_string(),
            name,
            kind,
            input,
            output,
            kernel_size,
            weights: weights.into(),
            biases: biases.into(),
            work_group: None,
            first: false,
            last: false,
        })
    }

    /// Override the kernel identifier handed to the kernel provider.
    pub fn with_kernel(mut self, kernel: impl Into<String>) -> Self {
        self.kernel = kernel.into();
        self
    }

    /// Attach a 2D work-group size hint for device backends.
    pub fn with_work_group(mut self, work_group: [u32; 2]) -> Self {
        self.work_group = Some(work_group);
        self
    }

    // --- Accessors ----------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn input_shape(&self) -> Shape {
        self.input
    }

    pub fn output_shape(&self) -> Shape {
        self.output
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    pub fn kernel(&self) -> &str {
        &self.kernel
    }

    pub fn work_group(&self) -> Option<[u32; 2]> {
        self.work_group
    }

    pub fn is_first(&self) -> bool {
        self.first
    }

    pub fn is_last(&self) -> bool {
        self.last
    }

    /// Global work size covering every output element once.
    ///
    /// Spatial kinds map `(column, row, feature map)` to `(x, y, z)`; dense
    /// kinds use a 1D range over the flat output.
    pub fn work_shape(&self) -> WorkShape {
        match self.kind {
            StageKind::Conv | StageKind::Pool(_) => WorkShape {
                x: self.output.width as u32,
                y: self.output.height as u32,
                z: self.output.depth as u32,
            },
            StageKind::FullConnect | StageKind::Distance => WorkShape {
                x: self.output.len() as u32,
                y: 1,
                z: 1,
            },
        }
    }

    // --- CPU reference ------------------------------------------------------

    /// Run this stage on the CPU, allocating the output.
    pub fn forward_cpu(&self, input: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0f32; self.output.len()];
        self.compute_cpu(input, &mut out);
        out
    }

    /// Run this stage on the CPU into a caller-provided output slice.
    ///
    /// # Panics
    /// Panics if `input` or `output` does not match the stage shapes.
    pub fn compute_cpu(&self, input: &[f32], output: &mut [f32]) {
        assert_eq!(input.len(), self.input.len(), "stage `{}`: input length", self.name);
        assert_eq!(output.len(), self.output.len(), "stage `{}`: output length", self.name);

        match self.kind {
            StageKind::Conv => self.conv_cpu(input, output),
            StageKind::Pool(PoolMode::Sum) => self.sum_pool_cpu(input, output),
            StageKind::Pool(PoolMode::Max) => self.max_pool_cpu(input, output),
            StageKind::FullConnect => self.full_cpu(input, output),
            StageKind::Distance => self.distance_cpu(input, output),
        }
    }

    fn conv_cpu(&self, input: &[f32], output: &mut [f32]) {
        let (i_shape, o_shape, k) = (self.input, self.output, self.kernel_size);
        for o in 0..o_shape.depth {
            for r in 0..o_shape.height {
                for c in 0..o_shape.width {
                    let mut acc = 0.0f32;
                    for i in 0..i_shape.depth {
                        let w_base = (o * i_shape.depth + i) * k * k;
                        for x in 0..k {
                            let row = i_shape.index(i, r + x, c);
                            let w_row = &self.weights[w_base + x * k..w_base + (x + 1) * k];
                            for (y, &w) in w_row.iter().enumerate() {
                                acc += w * input[row + y];
                            }
                        }
                    }
                    output[o_shape.index(o, r, c)] = sigmoid(acc + self.biases[o]);
                }
            }
        }
    }

    fn sum_pool_cpu(&self, input: &[f32], output: &mut [f32]) {
        let (i_shape, o_shape, k) = (self.input, self.output, self.kernel_size);
        for o in 0..o_shape.depth {
            for r in 0..o_shape.height {
                for c in 0..o_shape.width {
                    let mut sum = 0.0f32;
                    for x in 0..k {
                        let row = i_shape.index(o, r * k + x, c * k);
                        sum += input[row..row + k].iter().sum::<f32>();
                    }
                    output[o_shape.index(o, r, c)] =
                        sigmoid(self.weights[o] * sum + self.biases[o]);
                }
            }
        }
    }

    fn max_pool_cpu(&self, input: &[f32], output: &mut [f32]) {
        let (i_shape, o_shape, k) = (self.input, self.output, self.kernel_size);
        for o in 0..o_shape.depth {
            for r in 0..o_shape.height {
                for c in 0..o_shape.width {
                    let mut max = f32::NEG_INFINITY;
                    for x in 0..k {
                        let row = i_shape.index(o, r * k + x, c * k);
                        for &v in &input[row..row + k] {
                            max = max.max(v);
                        }
                    }
                    output[o_shape.index(o, r, c)] = max;
                }
            }
        }
    }

    fn full_cpu(&self, input: &[f32], output: &mut [f32]) {
        let n = input.len();
        for (o, out) in output.iter_mut().enumerate() {
            let row = &self.weights[o * n..(o + 1) * n];
            let dot: f32 = row.iter().zip(input).map(|(w, v)| w * v).sum();
            *out = sigmoid(dot + self.biases[o]);
        }
    }

    fn distance_cpu(&self, input: &[f32], output: &mut [f32]) {
        let n = input.len();
        for (o, out) in output.iter_mut().enumerate() {
            let row = &self.weights[o * n..(o + 1) * n];
            *out = row.iter().zip(input).map(|(w, v)| (w - v) * (w - v)).sum();
        }
    }

    // --- Device submission --------------------------------------------------

    /// Submit this stage for one work item to `device`, waiting on `wait`.
    ///
    /// Returns the completion token of the submitted work. The call does
    /// not block; the work runs whenever the device's queue gets to it.
    pub fn execute<D: Device>(
        &self,
        device: &mut D,
        kernel: &D::Kernel,
        item: WorkItem,
        input: BufferRange<'_, D::Buffer>,
        output: BufferRange<'_, D::Buffer>,
        wait: &[D::Token],
    ) -> Result<D::Token, DeviceError> {
        debug_assert_eq!(input.len, self.input.len());
        debug_assert_eq!(output.len, self.output.len());
        device.submit(
            Dispatch { item, kernel, input, output, work: self.work_shape() },
            wait,
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {} → {}", self.name, self.kind, self.input, self.output)
    }
}
