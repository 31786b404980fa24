// check.rs — Compare device results against the CPU reference.
//
// Every backend must agree with `Stage::compute_cpu` to within `TOLERANCE`
// per element. Disagreement is reported as a value, not an error: the run
// itself succeeded, the numbers are just wrong.

use serde::Serialize;

/// Absolute per-element tolerance between CPU and device results.
pub const TOLERANCE: f32 = 1e-4;

/// First element where the two result vectors disagree.
///
/// A length difference is reported at the first index past the shorter
/// vector, with the missing side as NaN.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("element {index}: cpu {cpu} vs device {device} (tolerance {tolerance})")]
pub struct CorrectnessMismatch {
    pub index: usize,
    pub cpu: f32,
    pub device: f32,
    pub tolerance: f32,
}

/// Summary of a successful comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CheckSummary {
    pub compared: usize,
    pub max_abs_diff: f32,
}

/// Compare `device` against `cpu` element by element.
///
/// NaN on either side never matches.
pub fn cross_check(
    cpu: &[f32],
    device: &[f32],
    tolerance: f32,
) -> Result<CheckSummary, CorrectnessMismatch> {
    let mut max_abs_diff = 0.0f32;
    for (index, (&c, &d)) in cpu.iter().zip(device).enumerate() {
        let diff = (c - d).abs();
        if diff.is_nan() || diff > tolerance {
            return Err(CorrectnessMismatch { index, cpu: c, device: d, tolerance });
        }
        max_abs_diff = max_abs_diff.max(diff);
    }
    if cpu.len() != device.len() {
        let index = cpu.len().min(device.len());
        return Err(CorrectnessMismatch {
            index,
            cpu: cpu.get(index).copied().unwrap_or(f32::NAN),
            device: device.get(index).copied().unwrap_or(f32::NAN),
            tolerance,
        });
    }
    Ok(CheckSummary { compared: cpu.len(), max_abs_diff })
}
