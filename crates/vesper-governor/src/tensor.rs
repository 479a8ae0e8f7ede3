//! Numeric buffer handles
//!
//! The governor never looks inside a buffer. It only needs the size metadata
//! and a way to dispose of the buffer when it is released or evicted.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a numeric buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    I32,
    U8,
}

impl DType {
    /// Size of one element in bytes
    pub fn size_bytes(&self) -> u64 {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
            DType::U8 => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::I32 => "int32",
            DType::U8 => "uint8",
        };
        f.write_str(name)
    }
}

/// Size and layout metadata of a numeric buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    /// Host-side bytes
    pub byte_size: u64,
    /// Device-side overhead (texture padding, staging copies)
    pub aux_bytes: u64,
    /// Dimensions
    pub shape: Vec<usize>,
    /// Element type
    pub dtype: DType,
}

impl TensorMeta {
    /// Metadata for a dense tensor of `shape` and `dtype`
    pub fn dense(shape: Vec<usize>, dtype: DType) -> Self {
        let elements: u64 = shape.iter().map(|&d| d as u64).product();
        Self {
            byte_size: elements * dtype.size_bytes(),
            aux_bytes: 0,
            shape,
            dtype,
        }
    }

    /// Attach device-side overhead
    pub fn with_aux_bytes(mut self, aux_bytes: u64) -> Self {
        self.aux_bytes = aux_bytes;
        self
    }
}

/// A buffer produced or consumed by the model collaborator
pub trait NumericBuffer: Send {
    /// Size metadata
    fn meta(&self) -> &TensorMeta;

    /// Free the underlying storage; called exactly once by the ledger
    fn dispose(&mut self);
}

/// Host-memory buffer
#[derive(Debug, Clone)]
pub struct HostTensor {
    meta: TensorMeta,
    data: Option<Vec<u8>>,
}

impl HostTensor {
    /// Zero-filled buffer of the given layout
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let meta = TensorMeta::dense(shape, dtype);
        let data = vec![0u8; meta.byte_size as usize];
        Self {
            meta,
            data: Some(data),
        }
    }

    /// Wrap existing bytes; the shape is taken as one-dimensional
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let meta = TensorMeta::dense(vec![data.len()], DType::U8);
        Self {
            meta,
            data: Some(data),
        }
    }

    /// Attach device-side overhead
    pub fn with_aux_bytes(mut self, aux_bytes: u64) -> Self {
        self.meta.aux_bytes = aux_bytes;
        self
    }

    /// Raw bytes, `None` once disposed
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Whether the storage has been freed
    pub fn is_disposed(&self) -> bool {
        self.data.is_none()
    }
}

impl NumericBuffer for HostTensor {
    fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    fn dispose(&mut self) {
        self.data = None;
    }
}
