// config.rs — Network description files.
//
// A network is a JSON document listing its stages in order:
//
//   {
//     "name": "lenet5",
//     "queue_barrier": 32,
//     "stages": [
//       { "type": "conv", "name": "conv1", "input": [32, 32, 1],
//         "kernel_size": 5, "out_depth": 6, "weights": [...], "biases": [...] },
//       { "type": "pool", "name": "pool2", "input": [28, 28, 6],
//         "kernel_size": 2, "mode": "sum", "weights": [...], "biases": [...] },
//       { "type": "full", "name": "full6", "input": [1, 1, 120],
//         "outputs": 84, "weights": [...], "biases": [...] },
//       { "type": "distance", "name": "rbf7", "input": [84, 1, 1],
//         "outputs": 10, "weights": [...] }
//     ]
//   }
//
// Every stage may also carry `"kernel": "<entry point>"` and
// `"work_group": [x, y]`. Output shapes are never written down; they follow
// from the input shape and the layer parameters, and `build_stages` checks
// that consecutive stages agree.
//
// `NetworkConfig::lenet5(seed)` produces the classic seven-layer LeNet-5
// with small deterministic pseudo-random parameters, which is what the CLI
// runs when no file is given.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::validate_topology;
use crate::rng::SimpleRng;
use crate::shape::Shape;
use crate::stage::{PoolMode, Stage};

/// Draws `len` parameters from `[-scale, scale)`.
type ParamFn<'a> = dyn FnMut(usize, f32) -> Vec<f32> + 'a;

fn default_barrier() -> usize {
    32
}

fn default_pool_mode() -> PoolMode {
    PoolMode::Sum
}

/// Layer-specific parameters, tagged by `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LayerConfig {
    Conv {
        kernel_size: usize,
        out_depth: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
    },
    Pool {
        kernel_size: usize,
        #[serde(default = "default_pool_mode")]
        mode: PoolMode,
        #[serde(default)]
        weights: Vec<f32>,
        #[serde(default)]
        biases: Vec<f32>,
    },
    Full {
        outputs: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
    },
    Distance {
        outputs: usize,
        weights: Vec<f32>,
    },
}

/// One stage entry of a network file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub input: Shape,
    #[serde(flatten)]
    pub layer: LayerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_group: Option<[u32; 2]>,
}

impl StageConfig {
    /// Build and validate the stage this entry describes.
    pub fn build(&self) -> Result<Stage, ConfigError> {
        let name = self.name.clone();
        let stage = match &self.layer {
            LayerConfig::Conv { kernel_size, out_depth, weights, biases } => Stage::conv(
                name, self.input, *kernel_size, *out_depth, weights.clone(), biases.clone(),
            )?,
            LayerConfig::Pool { kernel_size, mode, weights, biases } => Stage::pool(
                name, self.input, *kernel_size, *mode, weights.clone(), biases.clone(),
            )?,
            LayerConfig::Full { outputs, weights, biases } => Stage::full_connect(
                name, self.input, *outputs, weights.clone(), biases.clone(),
            )?,
            LayerConfig::Distance { outputs, weights } => {
                Stage::distance(name, self.input, *outputs, weights.clone())?
            }
        };
        let stage = match &self.kernel {
            Some(kernel) => stage.with_kernel(kernel.clone()),
            None => stage,
        };
        Ok(match self.work_group {
            Some(wg) => stage.with_work_group(wg),
            None => stage,
        })
    }
}

/// A complete network description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    /// Inputs between queue drains when running pipelined.
    #[serde(default = "default_barrier")]
    pub queue_barrier: usize,
    pub stages: Vec<StageConfig>,
}

impl NetworkConfig {
    /// Read and parse a network file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: NetworkConfig = serde_json::from_str(text)?;
        if config.queue_barrier == 0 {
            return Err(ConfigError::ZeroBarrier);
        }
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Build every stage and check that they chain.
    pub fn build_stages(&self) -> Result<Vec<Stage>, ConfigError> {
        let stages = self
            .stages
            .iter()
            .map(StageConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        validate_topology(&stages)?;
        Ok(stages)
    }

    /// The seven-layer LeNet-5 network with seeded pseudo-random parameters.
    ///
    /// ```text
    ///   conv1   32×32×1  → 28×28×6    5×5 kernels
    ///   pool2   28×28×6  → 14×14×6    2×2 sum
    ///   conv3   14×14×6  → 10×10×16   5×5 kernels
    ///   pool4   10×10×16 → 5×5×16     2×2 sum
    ///   conv5   5×5×16   → 1×1×120    5×5 kernels
    ///   full6   1×1×120  → 84
    ///   rbf7    84       → 10         Euclidean distance
    /// ```
    pub fn lenet5(seed: u64) -> Self {
        let mut rng = SimpleRng::new(seed);
        let mut params = |len: usize, scale: f32| rng.uniform(len, -scale, scale);

        let conv = |name: &str, input: [usize; 3], out_depth: usize, params: &mut ParamFn<'_>| {
            let fan_in = input[2] * 25;
            let scale = 1.0 / (fan_in as f32).sqrt();
            StageConfig {
                name: name.to_string(),
                input: input.into(),
                layer: LayerConfig::Conv {
                    kernel_size: 5,
                    out_depth,
                    weights: params(out_depth * fan_in, scale),
                    biases: params(out_depth, scale),
                },
                kernel: None,
                work_group: None,
            }
        };
        let pool = |name: &str, input: [usize; 3], params: &mut ParamFn<'_>| StageConfig {
            name: name.to_string(),
            input: input.into(),
            layer: LayerConfig::Pool {
                kernel_size: 2,
                mode: PoolMode::Sum,
                weights: params(input[2], 0.25),
                biases: params(input[2], 0.1),
            },
            kernel: None,
            work_group: None,
        };

        let stages = vec![
            conv("conv1", [32, 32, 1], 6, &mut params),
            pool("pool2", [28, 28, 6], &mut params),
            conv("conv3", [14, 14, 6], 16, &mut params),
            pool("pool4", [10, 10, 16], &mut params),
            conv("conv5", [5, 5, 16], 120, &mut params),
            StageConfig {
                name: "full6".to_string(),
                input: Shape::new(1, 1, 120),
                layer: LayerConfig::Full {
                    outputs: 84,
                    weights: params(84 * 120, 1.0 / (120f32).sqrt()),
                    biases: params(84, 0.1),
                },
                kernel: None,
                work_group: None,
            },
            StageConfig {
                name: "rbf7".to_string(),
                input: Shape::flat(84),
                layer: LayerConfig::Distance { outputs: 10, weights: params(10 * 84, 1.0) },
                kernel: None,
                work_group: None,
            },
        ];

        NetworkConfig { name: "lenet5".to_string(), queue_barrier: default_barrier(), stages }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageKind;

    const TINY: &str = r#"{
        "name": "tiny",
        "stages": [
            { "type": "pool", "name": "p", "input": [2, 2, 1], "kernel_size": 2, "mode": "max" },
            { "type": "distance", "name": "d", "input": [1, 1, 1], "outputs": 2,
              "weights": [0.0, 1.0], "kernel": "distance_forward", "work_group": [64, 1] }
        ]
    }"#;

    #[test]
    fn test_parse_minimal() {
        let cfg = NetworkConfig::from_json_str(TINY).unwrap();
        assert_eq!(cfg.name, "tiny");
        assert_eq!(cfg.queue_barrier, 32);
        let stages = cfg.build_stages().unwrap();
        assert_eq!(stages[0].kind(), StageKind::Pool(PoolMode::Max));
        assert_eq!(stages[1].work_group(), Some([64, 1]));
        assert_eq!(stages[1].kernel(), "distance_forward");
    }

    #[test]
    fn test_pool_mode_defaults_to_sum() {
        let json = r#"{ "type": "pool", "name": "p", "input": [2, 2, 1], "kernel_size": 2,
                        "weights": [1.0], "biases": [0.0] }"#;
        let s: StageConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(s.layer, LayerConfig::Pool { mode: PoolMode::Sum, .. }));
    }

    #[test]
    fn test_unknown_layer_type() {
        let json = r#"{ "name": "x",
            "stages": [ { "type": "lstm", "name": "l", "input": [1,1,1] } ] }"#;
        assert!(matches!(NetworkConfig::from_json_str(json), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_barrier_in_file() {
        let json = r#"{ "name": "x", "queue_barrier": 0, "stages": [] }"#;
        assert!(matches!(NetworkConfig::from_json_str(json), Err(ConfigError::ZeroBarrier)));
    }

    #[test]
    fn test_missing_file() {
        let err = NetworkConfig::load("/nonexistent/network.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_lenet5_deterministic() {
        assert_eq!(NetworkConfig::lenet5(3), NetworkConfig::lenet5(3));
        assert_ne!(NetworkConfig::lenet5(3), NetworkConfig::lenet5(4));
    }

    #[test]
    fn test_lenet5_builds() {
        let stages = NetworkConfig::lenet5(1).build_stages().unwrap();
        assert_eq!(stages.len(), 7);
        assert_eq!(stages[0].input_shape().len(), 1024);
        assert_eq!(stages[6].output_shape(), Shape::flat(10));
    }

    #[test]
    fn test_lenet5_survives_json() {
        let cfg = NetworkConfig::lenet5(9);
        let text = cfg.to_json_string().unwrap();
        let back = NetworkConfig::from_json_str(&text).unwrap();
        assert_eq!(back.name, "lenet5");
        assert_eq!(back.stages.len(), 7);
        let (a, b) = (cfg.build_stages().unwrap(), back.build_stages().unwrap());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.output_shape(), y.output_shape());
            for (wx, wy) in x.weights().iter().zip(y.weights()) {
                assert!((wx - wy).abs() < 1e-6);
            }
        }
    }
}
