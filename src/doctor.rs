//! Environment probe behind `musicgen-doctor`.
//!
//! Each check reports pass, fail, or skipped. The model-load check is skipped
//! when an earlier check already failed, since it cannot succeed.

use std::fmt;
use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use serde::Serialize;
use tokenizers::Tokenizer;

use crate::manager::preferred_device;
use crate::pipeline::{ModelFiles, ModelSource, MusicgenPipeline};
use crate::prompt::DEFAULT_PROMPT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckOutcome {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            detail: detail.into(),
        }
    }

    fn skipped(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Skipped,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = match self.status {
            CheckStatus::Pass => "✅",
            CheckStatus::Fail => "❌",
            CheckStatus::Skipped => "⏭️",
        };
        write!(f, "{mark} {}: {}", self.name, self.detail)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<CheckOutcome>,
}

impl DoctorReport {
    pub fn passed(&self) -> bool {
        self.checks
            .iter()
            .all(|check| check.status != CheckStatus::Fail)
    }

    fn any_failed(&self) -> bool {
        !self.passed()
    }

    /// One-line verdict for the end of the report.
    pub fn summary(&self) -> &'static str {
        let model_failed = self
            .checks
            .iter()
            .any(|check| check.name == MODEL_CHECK && check.status == CheckStatus::Fail);
        if self.passed() {
            "🎉 All checks passed! The generator should work."
        } else if model_failed {
            "⚠️  Model loading failed. This might be due to memory constraints."
        } else {
            "❌ Some checks failed. See the details above."
        }
    }
}

pub struct DoctorOptions {
    pub source: ModelSource,
    pub force_cpu: bool,
    pub cuda_device: usize,
    pub skip_model: bool,
}

const DEVICE_CHECK: &str = "compute device";
const TOKENIZER_CHECK: &str = "tokenizer";
const WEIGHTS_CHECK: &str = "model weights";
const MODEL_CHECK: &str = "model load";

pub fn run_checks(options: &DoctorOptions) -> DoctorReport {
    let mut report = DoctorReport::default();

    let device = if options.force_cpu {
        Device::Cpu
    } else {
        preferred_device(options.cuda_device)
    };
    report.checks.push(check_device(&device));
    report.checks.push(check_tokenizer(&options.source));

    let (weights_check, files) = check_weights(&options.source);
    report.checks.push(weights_check);

    let model_check = if options.skip_model {
        CheckOutcome::skipped(MODEL_CHECK, "--skip-model given")
    } else if report.any_failed() {
        CheckOutcome::skipped(MODEL_CHECK, "earlier checks failed")
    } else {
        match files {
            Some(files) => check_model(files, &options.source, &device),
            None => CheckOutcome::skipped(MODEL_CHECK, "no weights resolved"),
        }
    };
    report.checks.push(model_check);
    report
}

fn check_device(device: &Device) -> CheckOutcome {
    let smoke = Tensor::ones((2, 2), DType::F32, device)
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_scalar::<f32>());
    match smoke {
        Ok(sum) if sum == 4.0 => CheckOutcome::pass(DEVICE_CHECK, format!("{device:?}")),
        Ok(sum) => CheckOutcome::fail(DEVICE_CHECK, format!("{device:?} computed {sum}, expected 4")),
        Err(e) => CheckOutcome::fail(DEVICE_CHECK, format!("{device:?}: {e}")),
    }
}

fn check_tokenizer(source: &ModelSource) -> CheckOutcome {
    let path = match source.resolve_tokenizer() {
        Ok(path) => path,
        Err(e) => return CheckOutcome::fail(TOKENIZER_CHECK, e.to_string()),
    };
    let encoded = Tokenizer::from_file(&path).and_then(|tokenizer| tokenizer.encode(DEFAULT_PROMPT, true));
    match encoded {
        Ok(encoding) => CheckOutcome::pass(
            TOKENIZER_CHECK,
            format!("{} ({} tokens for a sample prompt)", path.display(), encoding.len()),
        ),
        Err(e) => CheckOutcome::fail(TOKENIZER_CHECK, format!("{}: {e}", path.display())),
    }
}

fn check_weights(source: &ModelSource) -> (CheckOutcome, Option<ModelFiles>) {
    match source.resolve() {
        Ok(files) => {
            let total_bytes: u64 = files
                .weights
                .iter()
                .filter_map(|path| std::fs::metadata(path).ok())
                .map(|meta| meta.len())
                .sum();
            let detail = format!(
                "{} file(s), {:.1} MiB in {}",
                files.weights.len(),
                total_bytes as f64 / (1024.0 * 1024.0),
                parent_dir(&files.weights)
            );
            (CheckOutcome::pass(WEIGHTS_CHECK, detail), Some(files))
        }
        Err(e) => (CheckOutcome::fail(WEIGHTS_CHECK, e.to_string()), None),
    }
}

fn parent_dir(paths: &[PathBuf]) -> String {
    paths
        .first()
        .and_then(|path| path.parent())
        .map(|dir| dir.display().to_string())
        .unwrap_or_default()
}

fn check_model(files: ModelFiles, source: &ModelSource, device: &Device) -> CheckOutcome {
    match MusicgenPipeline::from_files(files, source.variant, device, DType::F32) {
        Ok(pipeline) => CheckOutcome::pass(
            MODEL_CHECK,
            format!("{} loaded on {device:?}", pipeline.variant()),
        ),
        Err(e) => CheckOutcome::fail(MODEL_CHECK, e.to_string()),
    }
}
