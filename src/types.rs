//! Core tensor types shared by the engine and the accelerator seam
//!
//! A [`Tensor`] is an immutable, reference-counted byte buffer with a
//! precision and a shape. Views created by [`Tensor::share_slice`] point into
//! the same allocation, which is how demultiplexed shards avoid copies.

use crate::pipeline::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Tensor shape, outermost dimension first
pub type Shape = Vec<usize>;

/// Named tensors, ordered by name
pub type TensorMap = BTreeMap<String, Tensor>;

/// Named tensor specs, ordered by name
pub type TensorInfoMap = BTreeMap<String, TensorInfo>;

/// Element precision of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Precision {
    FP64,
    FP32,
    FP16,
    I64,
    I32,
    I16,
    I8,
    U16,
    U8,
}

impl Precision {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            Precision::FP64 | Precision::I64 => 8,
            Precision::FP32 | Precision::I32 => 4,
            Precision::FP16 | Precision::I16 | Precision::U16 => 2,
            Precision::I8 | Precision::U8 => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Precision::FP64 => "FP64",
            Precision::FP32 => "FP32",
            Precision::FP16 => "FP16",
            Precision::I64 => "I64",
            Precision::I32 => "I32",
            Precision::I16 => "I16",
            Precision::I8 => "I8",
            Precision::U16 => "U16",
            Precision::U8 => "U8",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format a shape as `[d0,d1,...]`
pub fn shape_to_string(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(","))
}

/// Immutable tensor buffer.
#[derive(Clone)]
pub struct Tensor {
    precision: Precision,
    shape: Shape,
    data: Arc<[u8]>,
    offset: usize,
    len: usize,
}

impl Tensor {
    /// Create a tensor owning `data`. The byte length must match the shape.
    pub fn new(precision: Precision, shape: Shape, data: Vec<u8>) -> PipelineResult<Self> {
        let expected = shape.iter().product::<usize>() * precision.size();
        if data.len() != expected {
            return Err(PipelineError::InvalidContentSize {
                expected,
                actual: data.len(),
            });
        }
        let len = data.len();
        Ok(Self {
            precision,
            shape,
            data: Arc::from(data),
            offset: 0,
            len,
        })
    }

    /// Zero-filled tensor
    pub fn zeros(precision: Precision, shape: Shape) -> Self {
        let len = shape.iter().product::<usize>() * precision.size();
        Self {
            precision,
            shape,
            data: Arc::from(vec![0u8; len]),
            offset: 0,
            len,
        }
    }

    /// FP32 tensor from values. The value count must match the shape.
    pub fn from_f32(shape: Shape, values: &[f32]) -> PipelineResult<Self> {
        Self::new(Precision::FP32, shape, bytemuck::cast_slice(values).to_vec())
    }

    /// I32 tensor from values. The value count must match the shape.
    pub fn from_i32(shape: Shape, values: &[i32]) -> PipelineResult<Self> {
        Self::new(Precision::I32, shape, bytemuck::cast_slice(values).to_vec())
    }

    #[inline]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn byte_size(&self) -> usize {
        self.len
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    /// Decode as FP32 values; `None` for other precisions.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.precision != Precision::FP32 {
            return None;
        }
        Some(bytemuck::pod_collect_to_vec(self.as_bytes()))
    }

    /// Decode as I32 values; `None` for other precisions.
    pub fn to_i32_vec(&self) -> Option<Vec<i32>> {
        if self.precision != Precision::I32 {
            return None;
        }
        Some(bytemuck::pod_collect_to_vec(self.as_bytes()))
    }

    /// A view over `len` bytes starting at `offset` of this tensor, sharing
    /// the same allocation.
    pub fn share_slice(&self, offset: usize, len: usize, shape: Shape) -> PipelineResult<Self> {
        let expected = shape.iter().product::<usize>() * self.precision.size();
        if offset + len > self.len || expected != len {
            return Err(PipelineError::Internal(format!(
                "slice [{}..{}) with shape {} does not fit tensor of {} bytes",
                offset,
                offset + len,
                shape_to_string(&shape),
                self.len
            )));
        }
        Ok(Self {
            precision: self.precision,
            shape,
            data: Arc::clone(&self.data),
            offset: self.offset + offset,
            len,
        })
    }

    /// Copy into a freshly allocated buffer.
    pub fn deep_copy(&self) -> Self {
        Self {
            precision: self.precision,
            shape: self.shape.clone(),
            data: Arc::from(self.as_bytes().to_vec()),
            offset: 0,
            len: self.len,
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("precision", &self.precision)
            .field("shape", &self.shape)
            .field("bytes", &self.len)
            .finish()
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.precision == other.precision
            && self.shape == other.shape
            && self.as_bytes() == other.as_bytes()
    }
}

/// One dimension of a model's declared tensor shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dimension {
    /// Accepts any size
    Any,
    Fixed(usize),
    /// Inclusive range
    Range { min: usize, max: usize },
}

impl Dimension {
    pub fn matches(&self, size: usize) -> bool {
        match *self {
            Dimension::Any => true,
            Dimension::Fixed(d) => d == size,
            Dimension::Range { min, max } => (min..=max).contains(&size),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Any => write!(f, "-1"),
            Dimension::Fixed(d) => write!(f, "{}", d),
            Dimension::Range { min, max } => write!(f, "{}:{}", min, max),
        }
    }
}

/// Declared spec of one model input or output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub precision: Precision,
    pub shape: Vec<Dimension>,
    /// Position of the batch dimension in the layout, if the layout has one
    pub batch_index: Option<usize>,
}

impl TensorInfo {
    /// Fixed-shape spec with the batch at dimension 0
    pub fn new(name: impl Into<String>, precision: Precision, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            precision,
            shape: shape.iter().map(|&d| Dimension::Fixed(d)).collect(),
            batch_index: Some(0),
        }
    }

    pub fn with_batch_index(mut self, batch_index: Option<usize>) -> Self {
        self.batch_index = batch_index;
        self
    }

    /// True when every dimension matches `dims`.
    pub fn shape_matches(&self, dims: &[usize]) -> bool {
        self.shape.len() == dims.len()
            && self.shape.iter().zip(dims).all(|(d, &size)| d.matches(size))
    }

    /// True when every dimension except `skip` matches `dims`.
    pub fn shape_matches_except(&self, dims: &[usize], skip: usize) -> bool {
        self.shape.len() == dims.len()
            && self
                .shape
                .iter()
                .zip(dims)
                .enumerate()
                .all(|(i, (d, &size))| i == skip || d.matches(size))
    }

    pub fn shape_string(&self) -> String {
        let dims: Vec<String> = self.shape.iter().map(|d| d.to_string()).collect();
        format!("[{}]", dims.join(","))
    }
}

/// Whether a model may change its batch size to fit incoming traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchingMode {
    #[default]
    Fixed,
    Auto,
}

/// Whether a model input may be reshaped to fit incoming traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeMode {
    #[default]
    Fixed,
    Auto,
}

/// Request tensors handed to the entry node by the serialization layer
#[derive(Debug, Clone, Default)]
pub struct InferenceRequest {
    pub inputs: TensorMap,
}

impl InferenceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.inputs.insert(name.into(), tensor);
        self
    }
}

/// Response tensors produced by the exit node
#[derive(Debug, Clone, Default)]
pub struct InferenceResponse {
    pub outputs: TensorMap,
}

impl InferenceResponse {
    pub fn output(&self, name: &str) -> Option<&Tensor> {
        self.outputs.get(name)
    }
}
