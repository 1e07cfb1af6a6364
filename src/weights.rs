// src/weights.rs

use half::{bf16, f16};
use log::debug;
use ndarray::{Array1, Array2, ArrayD, Ix1, Ix2, IxDyn};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Named f32 tensors read from one or more `.safetensors` files.
#[derive(Debug, Default)]
pub struct WeightStore {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every tensor of every file. Later files win on duplicate names.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut store = Self::new();
        for path in paths {
            store.extend_from_file(path)?;
        }
        Ok(store)
    }

    pub fn extend_from_file(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        self.extend_from_bytes(&bytes, path)
    }

    /// `origin` names the source in error messages.
    pub fn extend_from_bytes(&mut self, bytes: &[u8], origin: &Path) -> Result<()> {
        let safetensors = SafeTensors::deserialize(bytes).map_err(|e| Error::SafeTensors {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;

        for (name, view) in safetensors.tensors() {
            let data = tensor_to_f32(&name, &view)?;
            let array = ArrayD::from_shape_vec(IxDyn(view.shape()), data).map_err(|e| {
                Error::SafeTensors {
                    path: origin.to_path_buf(),
                    message: format!("tensor `{}`: {}", name, e),
                }
            })?;
            self.tensors.insert(name, array);
        }
        debug!("loaded {} tensors from {}", self.tensors.len(), origin.display());
        Ok(())
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.tensors.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn into_tensors(self) -> HashMap<String, ArrayD<f32>> {
        self.tensors
    }

    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(ArrayD::len).sum()
    }

    /// Removes a 2-D tensor and checks its shape.
    pub fn take_matrix(&mut self, name: &str, rows: usize, cols: usize) -> Result<Array2<f32>> {
        let tensor = self.take(name)?;
        check_shape(name, &[rows, cols], tensor.shape())?;
        tensor
            .into_dimensionality::<Ix2>()
            .map_err(|_| Error::ShapeMismatch {
                name: name.to_string(),
                expected: vec![rows, cols],
                actual: vec![],
            })
    }

    /// Removes a 1-D tensor and checks its length.
    pub fn take_vector(&mut self, name: &str, len: usize) -> Result<Array1<f32>> {
        let tensor = self.take(name)?;
        check_shape(name, &[len], tensor.shape())?;
        tensor
            .into_dimensionality::<Ix1>()
            .map_err(|_| Error::ShapeMismatch {
                name: name.to_string(),
                expected: vec![len],
                actual: vec![],
            })
    }

    fn take(&mut self, name: &str) -> Result<ArrayD<f32>> {
        self.tensors
            .remove(name)
            .ok_or_else(|| Error::TensorNotFound(name.to_string()))
    }
}

fn check_shape(name: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(Error::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

/// Widens a tensor's little-endian payload to f32.
pub fn tensor_to_f32(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>> {
    let data = view.data();
    let values = match view.dtype() {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
        Dtype::BF16 => data
            .chunks_exact(2)
            .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
        Dtype::F64 => data
            .chunks_exact(8)
            .map(|c| {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
            })
            .collect(),
        other => {
            return Err(Error::UnsupportedDtype {
                name: name.to_string(),
                dtype: format!("{:?}", other),
            })
        }
    };
    Ok(values)
}
