use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};
use ndarray::{ArrayD, Axis, Ix5};
use ort::{session::Session, value::TensorRef};
use tracing::{debug, info};

use super::backend::{build_session, SessionConfig};
use super::{InterpolationModel, KernelPair, ModelOutput};
use crate::tensor::Tensor;
use crate::tier::{ConvolutionGeometry, ResolutionTier, IMAGE_DEPTH};

const INPUT_FRAMES: &str = "input_frames";
const OUTPUT_CROP_A: &str = "padded_i1";
const OUTPUT_KERNEL_A_V: &str = "k1v";
const OUTPUT_KERNEL_A_H: &str = "k1h";
const OUTPUT_CROP_B: &str = "padded_i2";
const OUTPUT_KERNEL_B_V: &str = "k2v";
const OUTPUT_KERNEL_B_H: &str = "k2h";

const REQUIRED_OUTPUTS: [&str; 6] = [
    OUTPUT_CROP_A,
    OUTPUT_KERNEL_A_V,
    OUTPUT_KERNEL_A_H,
    OUTPUT_CROP_B,
    OUTPUT_KERNEL_B_V,
    OUTPUT_KERNEL_B_H,
];

/// The exported SepConv kernel-prediction network, run through ONNX Runtime.
///
/// The graph takes `input_frames` as `[1, 2D, S, S]` and produces the two
/// padded crops and four kernel stacks, either 4-D or with the leading time
/// axis already present.
pub struct OnnxSepConvModel {
    session: Session,
    geometry: ConvolutionGeometry,
}

impl OnnxSepConvModel {
    pub fn load(config: &SessionConfig<'_>, tier: ResolutionTier) -> Result<Self> {
        let geometry = ConvolutionGeometry::for_tier(tier)?;
        let started = Instant::now();
        let session = build_session(config)?;
        check_signature(&session, &geometry).with_context(|| {
            format!(
                "{} is not a {tier} SepConv network",
                config.model_path.display()
            )
        })?;

        info!(
            model = %config.model_path.display(),
            backend = %config.backend,
            tier = %tier,
            load_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "kernel-prediction network loaded"
        );
        Ok(Self { session, geometry })
    }

    /// Conventional model location for a tier inside `models_dir`.
    pub fn default_path(models_dir: &Path, tier: ResolutionTier) -> PathBuf {
        models_dir.join(tier.model_file_name())
    }
}

fn check_signature(session: &Session, geometry: &ConvolutionGeometry) -> Result<()> {
    let inputs = session.inputs();
    ensure!(
        inputs.len() == 1 && inputs[0].name() == INPUT_FRAMES,
        "expected a single '{INPUT_FRAMES}' input, found {:?}",
        inputs.iter().map(|i| i.name().to_string()).collect::<Vec<_>>()
    );

    if let ort::value::ValueType::Tensor { shape, .. } = inputs[0].dtype() {
        let dims: Vec<i64> = shape.iter().copied().collect();
        let expected = [
            1,
            (2 * geometry.depth) as i64,
            geometry.network_side as i64,
            geometry.network_side as i64,
        ];
        let trailing = &dims[dims.len().saturating_sub(4)..];
        let static_mismatch = trailing.len() == 4
            && trailing
                .iter()
                .zip(expected.iter())
                .any(|(&got, &want)| got > 0 && got != want);
        if static_mismatch {
            bail!("input '{INPUT_FRAMES}' has shape {dims:?}, expected {expected:?}");
        }
    }

    let outputs: Vec<String> = session
        .outputs()
        .iter()
        .map(|o| o.name().to_string())
        .collect();
    for name in REQUIRED_OUTPUTS {
        ensure!(
            outputs.iter().any(|o| o == name),
            "missing output '{name}' (model provides {outputs:?})"
        );
    }
    Ok(())
}

/// Normalizes a model output to `[1, 1, C, H, W]`.
fn to_tensor5(name: &str, array: ArrayD<f32>) -> Result<Tensor> {
    let array = match array.ndim() {
        4 => array.insert_axis(Axis(1)),
        5 => array,
        n => bail!("output '{name}' has {n} dimensions, expected 4 or 5"),
    };
    let array = array
        .into_dimensionality::<Ix5>()
        .with_context(|| format!("output '{name}' is not 5-D"))?;
    Ok(Tensor::from_array(array))
}

impl InterpolationModel for OnnxSepConvModel {
    fn input_side(&self) -> usize {
        self.geometry.network_side
    }

    fn image_depth(&self) -> usize {
        IMAGE_DEPTH
    }

    fn forward(&mut self, stacked: &Tensor) -> Result<ModelOutput> {
        let expected = self.geometry.stacked_shape();
        ensure!(
            stacked.shape() == expected,
            "stacked input has shape {:?}, expected {expected:?}",
            stacked.shape()
        );

        // The graph input has no time axis.
        let view = stacked.view().index_axis_move(Axis(1), 0);
        let input = TensorRef::from_array_view(view)?;

        let started = Instant::now();
        let outputs = self.session.run(ort::inputs![INPUT_FRAMES => input])?;
        let run_ms = started.elapsed().as_secs_f64() * 1000.0;

        let extract = |name: &str| -> Result<Tensor> {
            let array = outputs[name]
                .try_extract_array::<f32>()
                .with_context(|| format!("output '{name}' is not an f32 tensor"))?
                .to_owned();
            to_tensor5(name, array)
        };

        let result = ModelOutput {
            crop_a: extract(OUTPUT_CROP_A)?,
            kernels_a: KernelPair {
                vertical: extract(OUTPUT_KERNEL_A_V)?,
                horizontal: extract(OUTPUT_KERNEL_A_H)?,
            },
            crop_b: extract(OUTPUT_CROP_B)?,
            kernels_b: KernelPair {
                vertical: extract(OUTPUT_KERNEL_B_V)?,
                horizontal: extract(OUTPUT_KERNEL_B_H)?,
            },
        };
        result.validate(&self.geometry)?;

        debug!(session_run_ms = format!("{run_ms:.1}"), "SepConv network forward");
        Ok(result)
    }
}
