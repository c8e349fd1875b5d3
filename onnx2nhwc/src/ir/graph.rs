//! Core graph types shared across IRs.

use serde::{Deserialize, Serialize};

use crate::format::DataFormat;

pub type TensorId = usize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub id: TensorId,
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub format: DataFormat,
    pub kind: TensorKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    F32,
    I64,
    I32,
    I8,
    U8,
    Bool,
}

impl DType {
    /// Map an ONNX `TensorProto.DataType` code.
    pub fn from_onnx(code: i64) -> Option<DType> {
        match code {
            1 => Some(DType::F32),
            2 => Some(DType::U8),
            3 => Some(DType::I8),
            6 => Some(DType::I32),
            7 => Some(DType::I64),
            9 => Some(DType::Bool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorKind {
    /// Graph input - provided by caller
    Input,
    /// Graph output - returned to caller
    Output,
    /// Weights, biases and folded values - baked into the model
    Constant(TensorData),
    /// Intermediate activation
    Intermediate,
}

/// Raw payload of a constant tensor, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I64(_) => DType::I64,
        }
    }

    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            TensorData::F32(v) => v.clone(),
            TensorData::I64(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    pub fn to_i64(&self) -> Vec<i64> {
        match self {
            TensorData::F32(v) => v.iter().map(|&x| x as i64).collect(),
            TensorData::I64(v) => v.clone(),
        }
    }

    /// Pick elements by flat index, keeping the element type.
    pub fn gather(&self, indices: &[usize]) -> TensorData {
        match self {
            TensorData::F32(v) => TensorData::F32(indices.iter().map(|&i| v[i]).collect()),
            TensorData::I64(v) => TensorData::I64(indices.iter().map(|&i| v[i]).collect()),
        }
    }

    pub fn cast(&self, dtype: DType) -> Option<TensorData> {
        match dtype {
            DType::F32 => Some(TensorData::F32(self.to_f32())),
            DType::I64 | DType::I32 => Some(TensorData::I64(self.to_i64())),
            _ => None,
        }
    }
}

/// A compile-time-known value: shape plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantValue {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl ConstantValue {
    pub fn new(shape: Vec<usize>, data: TensorData) -> Self {
        Self { shape, data }
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self::new(vec![], TensorData::F32(vec![value]))
    }

    pub fn vector_f32(values: Vec<f32>) -> Self {
        Self::new(vec![values.len()], TensorData::F32(values))
    }

    pub fn vector_i64(values: Vec<i64>) -> Self {
        Self::new(vec![values.len()], TensorData::I64(values))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// The single element of a one-element constant, whatever its rank.
    pub fn as_scalar_f32(&self) -> Option<f32> {
        if self.len() == 1 {
            self.data.to_f32().first().copied()
        } else {
            None
        }
    }

    pub fn reshape(&self, shape: Vec<usize>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), self.len());
        Self::new(shape, self.data.clone())
    }

    /// General n-d transpose: output axis `i` is input axis `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Self {
        let out_shape: Vec<usize> = perm.iter().map(|&p| self.shape[p]).collect();
        let in_strides = strides(&self.shape);
        let perm_strides: Vec<usize> = perm.iter().map(|&p| in_strides[p]).collect();
        let indices: Vec<usize> = MultiIndex::new(&out_shape)
            .map(|idx| idx.iter().zip(&perm_strides).map(|(i, s)| i * s).sum())
            .collect();
        Self::new(out_shape, self.data.gather(&indices))
    }

    /// Keep `start..end` along `axis`.
    pub fn slice_axis(&self, axis: usize, start: usize, end: usize) -> Self {
        let mut out_shape = self.shape.clone();
        out_shape[axis] = end - start;
        let in_strides = strides(&self.shape);
        let indices: Vec<usize> = MultiIndex::new(&out_shape)
            .map(|mut idx| {
                idx[axis] += start;
                idx.iter().zip(&in_strides).map(|(i, s)| i * s).sum()
            })
            .collect();
        Self::new(out_shape, self.data.gather(&indices))
    }
}

/// Row-major strides for a shape.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Iterates all multi-indices of a shape in row-major order.
pub struct MultiIndex {
    shape: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl MultiIndex {
    pub fn new(shape: &[usize]) -> Self {
        let next = if shape.iter().any(|&d| d == 0) {
            None
        } else {
            Some(vec![0; shape.len()])
        };
        Self {
            shape: shape.to_vec(),
            next,
        }
    }
}

impl Iterator for MultiIndex {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let current = self.next.take()?;
        let mut succ = current.clone();
        let mut axis = succ.len();
        loop {
            if axis == 0 {
                break;
            }
            axis -= 1;
            succ[axis] += 1;
            if succ[axis] < self.shape[axis] {
                self.next = Some(succ);
                break;
            }
            succ[axis] = 0;
        }
        Some(current)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph<Op> {
    pub tensors: Vec<Tensor>,
    pub ops: Vec<Op>,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

impl<Op> Default for Graph<Op> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Op> Graph<Op> {
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id]
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id]
    }

    pub fn new() -> Self {
        Self {
            tensors: Vec::new(),
            ops: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn add_tensor(
        &mut self,
        name: String,
        shape: Vec<usize>,
        dtype: DType,
        format: DataFormat,
        kind: TensorKind,
    ) -> TensorId {
        let id = self.tensors.len();
        self.tensors.push(Tensor {
            id,
            name,
            shape,
            dtype,
            format,
            kind,
        });
        id
    }

    pub fn find_tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|t| t.name == name)
    }
}
