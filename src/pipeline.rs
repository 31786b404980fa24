// pipeline.rs — An ordered chain of stages bound to one device.
//
// BUFFER LAYOUT
// ─────────────
// Between every pair of adjacent stages sits a boundary with two buffers,
// selected by the parity of the input's sequence number. The first stage
// reads from a shared input buffer holding all N inputs back to back; the
// last stage writes into a shared output buffer laid out the same way:
//
//   input[N·in] ─▶ stage 0 ─▶ b0[n%2] ─▶ stage 1 ─▶ b1[n%2] ─▶ … ─▶ stage S-1 ─▶ output[N·out]
//   (offset n·in)                                                               (offset n·out)
//
// A single buffer per boundary would already be safe under the dependency
// rule in token_pool.rs; two buffers let input n+1 start writing while
// input n is still being read, which is where the overlap comes from.
//
// The I/O buffers are sized per run with `reserve_io(n)` and only ever
// grow. The boundary buffers are allocated once in `new`.
//
// The pipeline never blocks; `execute` only submits. Whoever drives it
// (see scheduler.rs) is responsible for supplying correct wait tokens.

use log::{debug, info};

use crate::config::NetworkConfig;
use crate::device::{BufferRange, Device};
use crate::error::{ConfigError, DeviceError, Error, Result};
use crate::stage::Stage;
use crate::token_pool::{PoolError, WorkItem};

/// Check that `stages` form a valid chain: non-empty, and every stage's
/// output shape equals the next stage's input shape.
pub fn validate_topology(stages: &[Stage]) -> Result<(), ConfigError> {
    if stages.is_empty() {
        return Err(ConfigError::EmptyPipeline);
    }
    for (index, pair) in stages.windows(2).enumerate() {
        let (a, b) = (&pair[0], &pair[1]);
        if a.output_shape() != b.input_shape() {
            return Err(ConfigError::ShapeMismatch {
                index,
                name: a.name().to_string(),
                output: a.output_shape(),
                next_input: b.input_shape(),
            });
        }
    }
    Ok(())
}

/// Stages, their compiled kernels and the buffers connecting them.
pub struct Pipeline<D: Device> {
    stages: Vec<Stage>,
    kernels: Vec<D::Kernel>,
    /// `boundaries[i]` connects stage `i` to stage `i + 1`.
    boundaries: Vec<[D::Buffer; 2]>,
    input: Option<D::Buffer>,
    output: Option<D::Buffer>,
    /// Number of inputs the I/O buffers can hold.
    io_capacity: usize,
}

impl<D: Device> Pipeline<D> {
    /// Validate the chain, build one kernel per stage and allocate the
    /// boundary buffers.
    pub fn new(device: &mut D, mut stages: Vec<Stage>) -> Result<Self> {
        validate_topology(&stages)?;

        let last = stages.len() - 1;
        for (i, stage) in stages.iter_mut().enumerate() {
            stage.first = i == 0;
            stage.last = i == last;
        }

        let kernels = stages
            .iter()
            .map(|s| device.load_kernel(s))
            .collect::<Result<Vec<_>, DeviceError>>()?;

        let mut boundaries = Vec::with_capacity(last);
        for pair in stages.windows(2) {
            let len = pair[0].output_shape().len();
            let label =
                |parity: usize| format!("{} → {} [{parity}]", pair[0].name(), pair[1].name());
            boundaries.push([
                device.create_buffer(&label(0), len)?,
                device.create_buffer(&label(1), len)?,
            ]);
        }

        info!(
            "pipeline: {} stages on {} ({} → {} floats per input)",
            stages.len(),
            device.describe(),
            stages[0].input_shape().len(),
            stages[last].output_shape().len(),
        );
        for stage in &stages {
            debug!("  {stage}");
        }

        Ok(Pipeline { stages, kernels, boundaries, input: None, output: None, io_capacity: 0 })
    }

    /// Build a pipeline from a parsed network description.
    pub fn from_config(device: &mut D, config: &NetworkConfig) -> Result<Self> {
        Self::new(device, config.build_stages()?)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false; construction rejects empty chains.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Floats per input.
    pub fn in_size(&self) -> usize {
        self.stages[0].input_shape().len()
    }

    /// Floats per output.
    pub fn out_size(&self) -> usize {
        self.stages[self.stages.len() - 1].output_shape().len()
    }

    /// Number of inputs the current I/O buffers hold.
    pub fn io_capacity(&self) -> usize {
        self.io_capacity
    }

    // --- CPU reference ------------------------------------------------------

    /// Run one input through every stage on the CPU.
    pub fn forward_cpu(&self, input: &[f32]) -> Vec<f32> {
        self.stages
            .iter()
            .fold(input.to_vec(), |acc, stage| stage.forward_cpu(&acc))
    }

    /// Run `n` back-to-back inputs through the CPU reference.
    pub fn forward_cpu_batch(&self, inputs: &[f32], n: usize) -> Result<Vec<f32>> {
        self.check_inputs(inputs, n)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        Ok(inputs
            .chunks_exact(self.in_size())
            .flat_map(|one| self.forward_cpu(one))
            .collect())
    }

    pub(crate) fn check_inputs(&self, inputs: &[f32], n: usize) -> Result<()> {
        let expected = n * self.in_size();
        if inputs.len() != expected {
            return Err(Error::SizeMismatch { what: "inputs", expected, actual: inputs.len() });
        }
        Ok(())
    }

    // --- Device I/O ---------------------------------------------------------

    /// Make sure the I/O buffers hold at least `n` inputs and outputs.
    pub fn reserve_io(&mut self, device: &mut D, n: usize) -> Result<(), DeviceError> {
        if n <= self.io_capacity && self.input.is_some() {
            return Ok(());
        }
        let n = n.max(1);
        debug!("pipeline: growing I/O buffers to {n} inputs");
        self.io_capacity = 0;
        for old in [self.input.take(), self.output.take()].into_iter().flatten() {
            device.release_buffer(old)?;
        }
        self.input = Some(device.create_buffer("pipeline input", n * self.in_size())?);
        self.output = Some(device.create_buffer("pipeline output", n * self.out_size())?);
        self.io_capacity = n;
        Ok(())
    }

    /// Upload `n` inputs, growing the input buffer if needed.
    pub fn write_inputs(&mut self, device: &mut D, inputs: &[f32], n: usize) -> Result<()> {
        self.check_inputs(inputs, n)?;
        self.reserve_io(device, n)?;
        if let Some(buffer) = &self.input {
            device.copy_in(buffer, 0, inputs)?;
        }
        Ok(())
    }

    /// Read back the outputs of the first `n` inputs.
    pub fn read_outputs(&self, device: &mut D, n: usize) -> Result<Vec<f32>, DeviceError> {
        let mut out = vec![0.0f32; n * self.out_size()];
        if n == 0 {
            return Ok(out);
        }
        let buffer = self.io_buffer(&self.output, n - 1)?;
        device.copy_out(buffer, 0, &mut out)?;
        Ok(out)
    }

    fn io_buffer<'a>(
        &self,
        buffer: &'a Option<D::Buffer>,
        sequence: usize,
    ) -> Result<&'a D::Buffer, DeviceError> {
        match buffer {
            Some(b) if sequence < self.io_capacity => Ok(b),
            _ => Err(DeviceError::OutOfRange {
                offset: sequence,
                len: 1,
                capacity: self.io_capacity,
            }),
        }
    }

    // --- Submission ---------------------------------------------------------

    /// Submit work item `item` after `wait`, returning its token.
    ///
    /// Stage `s` of input `n` reads boundary `s - 1` and writes boundary
    /// `s`, both at parity `n % 2`; the first stage reads input slot `n`
    /// and the last stage writes output slot `n`.
    pub fn execute(&self, device: &mut D, item: WorkItem, wait: &[D::Token]) -> Result<D::Token> {
        let WorkItem { stage: s, sequence: n } = item;
        let stage = self
            .stages
            .get(s)
            .ok_or(PoolError::StageOutOfRange { item, stages: self.stages.len() })?;
        let parity = n % 2;

        let in_len = stage.input_shape().len();
        let input = if stage.is_first() {
            BufferRange::new(self.io_buffer(&self.input, n)?, n * in_len, in_len)
        } else {
            BufferRange::new(&self.boundaries[s - 1][parity], 0, in_len)
        };

        let out_len = stage.output_shape().len();
        let output = if stage.is_last() {
            BufferRange::new(self.io_buffer(&self.output, n)?, n * out_len, out_len)
        } else {
            BufferRange::new(&self.boundaries[s][parity], 0, out_len)
        };

        Ok(stage.execute(device, &self.kernels[s], item, input, output, wait)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostDevice;
    use crate::shape::Shape;
    use crate::stage::PoolMode;

    fn small_chain() -> Vec<Stage> {
        vec![
            Stage::conv("c", Shape::new(4, 4, 1), 3, 2, vec![0.1; 18], vec![0.0; 2]).unwrap(),
            Stage::pool("p", Shape::new(2, 2, 2), 2, PoolMode::Max, vec![], vec![]).unwrap(),
            Stage::full_connect("f", Shape::new(1, 1, 2), 3, vec![0.5; 6], vec![0.0; 3]).unwrap(),
        ]
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let err = validate_topology(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyPipeline));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let stages = vec![
            Stage::pool("p", Shape::new(4, 4, 1), 2, PoolMode::Max, vec![], vec![]).unwrap(),
            Stage::full_connect("f", Shape::flat(4), 2, vec![0.0; 8], vec![0.0; 2]).unwrap(),
        ];
        // Same element count, different shape.
        let err = validate_topology(&stages).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ShapeMismatch { index: 0, output, next_input, .. }
                if output == Shape::new(2, 2, 1) && next_input == Shape::flat(4)
        ));
    }

    #[test]
    fn test_new_marks_first_and_last() {
        let mut dev = HostDevice::in_order();
        let p = Pipeline::new(&mut dev, small_chain()).unwrap();
        assert_eq!(p.len(), 3);
        assert!(p.stages()[0].is_first() && !p.stages()[0].is_last());
        assert!(!p.stages()[1].is_first() && !p.stages()[1].is_last());
        assert!(p.stages()[2].is_last());
        assert_eq!(p.in_size(), 16);
        assert_eq!(p.out_size(), 3);
    }

    #[test]
    fn test_single_stage_is_first_and_last() {
        let mut dev = HostDevice::in_order();
        let stages = vec![Stage::distance("d", Shape::flat(2), 1, vec![0.0, 0.0]).unwrap()];
        let p = Pipeline::new(&mut dev, stages).unwrap();
        assert!(p.stages()[0].is_first() && p.stages()[0].is_last());
    }

    #[test]
    fn test_execute_without_io_fails() {
        let mut dev = HostDevice::in_order();
        let p = Pipeline::new(&mut dev, small_chain()).unwrap();
        let err = p.execute(&mut dev, WorkItem::new(0, 0), &[]).unwrap_err();
        assert!(matches!(err, Error::Device(DeviceError::OutOfRange { .. })));
    }

    #[test]
    fn test_reserve_io_only_grows() {
        let mut dev = HostDevice::in_order();
        let mut p = Pipeline::new(&mut dev, small_chain()).unwrap();
        let base = dev.allocated_floats();
        let per_input = p.in_size() + p.out_size();
        p.reserve_io(&mut dev, 4).unwrap();
        p.reserve_io(&mut dev, 2).unwrap();
        assert_eq!(p.io_capacity(), 4);
        assert_eq!(dev.allocated_floats(), base + 4 * per_input);
        p.reserve_io(&mut dev, 9).unwrap();
        assert_eq!(p.io_capacity(), 9);
        // The smaller buffers were released, not kept alongside.
        assert_eq!(dev.allocated_floats(), base + 9 * per_input);
    }

    #[test]
    fn test_sequential_execution_matches_cpu() {
        let mut dev = HostDevice::in_order();
        let mut p = Pipeline::new(&mut dev, small_chain()).unwrap();
        let inputs: Vec<f32> = (0..32).map(|i| i as f32 / 32.0).collect();
        p.write_inputs(&mut dev, &inputs, 2).unwrap();
        for n in 0..2 {
            for s in 0..p.len() {
                p.execute(&mut dev, WorkItem::new(s, n), &[]).unwrap();
            }
        }
        let got = p.read_outputs(&mut dev, 2).unwrap();
        let want = p.forward_cpu_batch(&inputs, 2).unwrap();
        for (g, w) in got.iter().zip(&want) {
            assert!((g - w).abs() < 1e-6);
        }
    }

    #[test]
    fn test_write_inputs_size_mismatch() {
        let mut dev = HostDevice::in_order();
        let mut p = Pipeline::new(&mut dev, small_chain()).unwrap();
        let err = p.write_inputs(&mut dev, &[0.0; 15], 1).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 16, actual: 15, .. }));
    }
}
