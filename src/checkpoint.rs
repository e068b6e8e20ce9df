//! Checkpoint save / load.
//!
//! Saving writes every parameter of a `VarMap` to safetensors. Loading is
//! non-strict: parameters present in the checkpoint with the right shape are
//! copied in place, everything else is left untouched and reported.
//!
//! Supported inputs:
//! - `.safetensors`
//! - PyTorch pickles (`.pth`, `.pt`, `.bin`), either a bare state dict or a
//!   dict holding it under `state_dict`

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: Vec<usize>,
    pub found: Vec<usize>,
}

/// Outcome of a non-strict load. Names are relative to the load scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Model parameters with no checkpoint entry.
    pub missing: Vec<String>,
    /// Checkpoint entries with no model parameter.
    pub unexpected: Vec<String>,
    pub mismatched: Vec<ShapeMismatch>,
}

impl LoadReport {
    /// Every parameter matched and nothing was left over.
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

pub fn save_checkpoint(varmap: &VarMap, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    varmap.save(path)?;
    tracing::info!(
        path = %path.display(),
        tensors = varmap.all_vars().len(),
        "saved checkpoint"
    );
    Ok(())
}

/// Read all tensors of a checkpoint onto the CPU.
pub fn read_checkpoint(path: &Path) -> Result<HashMap<String, Tensor>> {
    let weight_load = |e: candle_core::Error| {
        Error::WeightLoad(format!("failed to read {}: {e}", path.display()))
    };
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match ext {
        "safetensors" => candle_core::safetensors::load(path, &Device::Cpu).map_err(weight_load),
        "pth" | "pt" | "bin" => {
            let tensors = candle_core::pickle::read_all_with_key(path, Some("state_dict"))
                .or_else(|_| candle_core::pickle::read_all(path))
                .map_err(weight_load)?;
            Ok(tensors.into_iter().collect())
        }
        other => Err(Error::WeightLoad(format!(
            "unsupported checkpoint format '{other}' for {}",
            path.display()
        ))),
    }
}

/// Normalize checkpoint keys.
///
/// Strips a leading `module.` (data-parallel wrappers), drops BatchNorm
/// `num_batches_tracked` counters, and with `prefix` keeps only the keys under
/// it with the prefix removed.
pub fn revise_keys(state: HashMap<String, Tensor>, prefix: Option<&str>) -> HashMap<String, Tensor> {
    let prefix = prefix.map(|p| {
        if p.is_empty() || p.ends_with('.') {
            p.to_string()
        } else {
            format!("{p}.")
        }
    });
    state
        .into_iter()
        .filter(|(key, _)| !key.ends_with("num_batches_tracked"))
        .filter_map(|(key, tensor)| {
            let key = match key.strip_prefix("module.") {
                Some(rest) => rest.to_string(),
                None => key,
            };
            match &prefix {
                Some(p) => key
                    .strip_prefix(p.as_str())
                    .map(|rest| (rest.to_string(), tensor)),
                None => Some((key, tensor)),
            }
        })
        .collect()
}

/// Copy matching tensors into the parameters of `varmap` under `scope`.
pub fn load_state_dict(
    varmap: &VarMap,
    state: &HashMap<String, Tensor>,
    scope: &str,
) -> Result<LoadReport> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::WeightLoad("parameter store lock poisoned".to_string()))?;
    let scope = if scope.is_empty() {
        String::new()
    } else {
        format!("{scope}.")
    };

    let mut report = LoadReport::default();
    let mut names: Vec<&String> = data.keys().filter(|n| n.starts_with(&scope)).collect();
    names.sort();

    for name in names {
        let var = &data[name];
        let key = &name[scope.len()..];
        match state.get(key) {
            None => report.missing.push(key.to_string()),
            Some(tensor) if tensor.dims() != var.dims() => report.mismatched.push(ShapeMismatch {
                name: key.to_string(),
                expected: var.dims().to_vec(),
                found: tensor.dims().to_vec(),
            }),
            Some(tensor) => {
                let tensor = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
                var.set(&tensor)?;
                report.loaded.push(key.to_string());
            }
        }
    }

    report.unexpected = state
        .keys()
        .filter(|key| !data.contains_key(&format!("{scope}{key}")))
        .cloned()
        .collect();
    report.unexpected.sort();

    Ok(report)
}

/// Read, revise and non-strictly load a checkpoint into the whole `varmap`.
pub fn load_checkpoint(
    varmap: &VarMap,
    path: impl AsRef<Path>,
    prefix: Option<&str>,
) -> Result<LoadReport> {
    load_checkpoint_scoped(varmap, path, prefix, "")
}

/// Like [`load_checkpoint`], restricted to parameters under `scope`.
pub fn load_checkpoint_scoped(
    varmap: &VarMap,
    path: impl AsRef<Path>,
    prefix: Option<&str>,
    scope: &str,
) -> Result<LoadReport> {
    let path = path.as_ref();
    let state = revise_keys(read_checkpoint(path)?, prefix);
    let report = load_state_dict(varmap, &state, scope)?;
    log_report(path, &report);
    Ok(report)
}

fn log_report(path: &Path, report: &LoadReport) {
    tracing::info!(
        path = %path.display(),
        loaded = report.loaded.len(),
        missing = report.missing.len(),
        unexpected = report.unexpected.len(),
        mismatched = report.mismatched.len(),
        "loaded checkpoint"
    );
    if !report.missing.is_empty() {
        tracing::warn!("missing keys in source state_dict: {}", report.missing.join(", "));
    }
    if !report.unexpected.is_empty() {
        tracing::warn!("unexpected keys in source state_dict: {}", report.unexpected.join(", "));
    }
    for m in &report.mismatched {
        tracing::warn!(
            "size mismatch for {}: checkpoint {:?}, model {:?}",
            m.name,
            m.found,
            m.expected
        );
    }
}
