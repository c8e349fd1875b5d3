//! Tensor layout tags and the rules for moving between them.
//!
//! Every value flowing through a translation carries exactly one
//! [`DataFormat`]. Constants are layout-free; generic tensors keep the
//! source's channel-first axis order; interleaved image batches are 4-D
//! channel-last `(N, H, W, C)` values.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ir::graph::{ConstantValue, TensorId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// Compile-time-known value with no spatial layout.
    Constant,
    /// N-d value in the source's channel-first axis order.
    GenericTensor,
    /// 4-D channel-last `(N, H, W, C)` value.
    InterleavedImageBatch,
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::Constant => write!(f, "constant"),
            DataFormat::GenericTensor => write!(f, "generic tensor"),
            DataFormat::InterleavedImageBatch => write!(f, "interleaved image batch"),
        }
    }
}

/// Whether a value tagged `a` can feed an operation expecting `b` without
/// an inserted layout conversion.
pub fn compatible(a: DataFormat, b: DataFormat) -> bool {
    use DataFormat::*;
    match (a, b) {
        (Constant, _) | (_, Constant) => true,
        (GenericTensor, GenericTensor) => true,
        (InterleavedImageBatch, InterleavedImageBatch) => true,
        (GenericTensor, InterleavedImageBatch) | (InterleavedImageBatch, GenericTensor) => false,
    }
}

/// `(N, C, H, W)` -> `(N, H, W, C)`
pub const TO_CHANNELS_LAST: [usize; 4] = [0, 2, 3, 1];
/// `(N, H, W, C)` -> `(N, C, H, W)`
pub const TO_CHANNELS_FIRST: [usize; 4] = [0, 3, 1, 2];

/// Position of a channel-first axis once the value is channel-last.
pub fn channels_last_axis(axis: usize) -> usize {
    match axis {
        0 => 0,
        1 => 3,
        a => a - 1,
    }
}

/// Position of a channel-last axis in the channel-first order.
pub fn channels_first_axis(axis: usize) -> usize {
    match axis {
        0 => 0,
        3 => 1,
        a => a + 1,
    }
}

pub fn to_channels_last_shape(shape: &[usize]) -> Option<[usize; 4]> {
    match *shape {
        [n, c, h, w] => Some([n, h, w, c]),
        _ => None,
    }
}

pub fn to_channels_first_shape(shape: [usize; 4]) -> Vec<usize> {
    let [n, h, w, c] = shape;
    vec![n, c, h, w]
}

/// True when the channel-first and channel-last orderings of a 4-D shape
/// visit elements in the same linear order, so a reshape can skip the
/// layout conversion.
pub fn layout_preserving(shape_nchw: &[usize]) -> bool {
    match *shape_nchw {
        [_, c, h, w] => c == 1 || h * w == 1,
        _ => false,
    }
}

/// Normalize a possibly-negative axis against `rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank = rank as i64;
    let axis = if axis < 0 { axis + rank } else { axis };
    (0..rank).contains(&axis).then_some(axis as usize)
}

/// A tensor reference together with its format tag.
///
/// The tag and the data it governs travel together: a constant carries its
/// value, a generic tensor its channel-first shape, an image batch its
/// `(N, H, W, C)` shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Constant(Arc<ConstantValue>),
    Generic { id: TensorId, shape: Vec<usize> },
    Image { id: TensorId, shape: [usize; 4] },
}

impl Operand {
    pub fn constant(value: ConstantValue) -> Self {
        Operand::Constant(Arc::new(value))
    }

    pub fn format(&self) -> DataFormat {
        match self {
            Operand::Constant(_) => DataFormat::Constant,
            Operand::Generic { .. } => DataFormat::GenericTensor,
            Operand::Image { .. } => DataFormat::InterleavedImageBatch,
        }
    }

    /// Shape in this operand's own axis order.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Operand::Constant(value) => value.shape.clone(),
            Operand::Generic { shape, .. } => shape.clone(),
            Operand::Image { shape, .. } => shape.to_vec(),
        }
    }

    /// Shape in the source's channel-first axis order.
    pub fn source_shape(&self) -> Vec<usize> {
        match self {
            Operand::Image { shape, .. } => to_channels_first_shape(*shape),
            other => other.shape(),
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            Operand::Constant(value) => value.rank(),
            Operand::Generic { shape, .. } => shape.len(),
            Operand::Image { .. } => 4,
        }
    }

    pub fn tensor_id(&self) -> Option<TensorId> {
        match self {
            Operand::Constant(_) => None,
            Operand::Generic { id, .. } | Operand::Image { id, .. } => Some(*id),
        }
    }

    pub fn as_constant(&self) -> Option<&ConstantValue> {
        match self {
            Operand::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Operand::Constant(_))
    }
}

/// Re-lay a constant so it broadcasts against operands of `format` the way
/// it broadcast against the channel-first originals.
///
/// Only image batches need work: the constant is left-padded to rank 4 and
/// permuted channel-last. Scalars are returned as-is.
pub fn align_constant(value: &ConstantValue, format: DataFormat) -> ConstantValue {
    match format {
        DataFormat::InterleavedImageBatch if (1..=4).contains(&value.rank()) => {
            let mut shape = vec![1; 4 - value.rank()];
            shape.extend_from_slice(&value.shape);
            value.reshape(shape).permute(&TO_CHANNELS_LAST)
        }
        DataFormat::Constant | DataFormat::GenericTensor | DataFormat::InterleavedImageBatch => {
            value.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::graph::TensorData;
    use proptest::prelude::*;

    const ALL: [DataFormat; 3] = [
        DataFormat::Constant,
        DataFormat::GenericTensor,
        DataFormat::InterleavedImageBatch,
    ];

    fn any_format() -> impl Strategy<Value = DataFormat> {
        prop::sample::select(ALL.to_vec())
    }

    #[test]
    fn constant_is_compatible_with_everything() {
        for x in ALL {
            assert!(compatible(DataFormat::Constant, x));
            assert!(compatible(x, DataFormat::Constant));
        }
    }

    #[test]
    fn generic_and_image_never_mix() {
        assert!(!compatible(
            DataFormat::InterleavedImageBatch,
            DataFormat::GenericTensor
        ));
        assert!(!compatible(
            DataFormat::GenericTensor,
            DataFormat::InterleavedImageBatch
        ));
        assert!(compatible(DataFormat::GenericTensor, DataFormat::GenericTensor));
        assert!(compatible(
            DataFormat::InterleavedImageBatch,
            DataFormat::InterleavedImageBatch
        ));
    }

    proptest! {
        #[test]
        fn compatibility_is_symmetric(a in any_format(), b in any_format()) {
            prop_assert_eq!(compatible(a, b), compatible(b, a));
        }

        #[test]
        fn compatibility_is_reflexive(a in any_format()) {
            prop_assert!(compatible(a, a));
        }

        #[test]
        fn axis_translation_round_trips(axis in 0usize..4) {
            prop_assert_eq!(channels_first_axis(channels_last_axis(axis)), axis);
        }

        #[test]
        fn shape_translation_round_trips(n in 1usize..4, c in 1usize..8, h in 1usize..8, w in 1usize..8) {
            let nchw = vec![n, c, h, w];
            let nhwc = to_channels_last_shape(&nchw).unwrap();
            prop_assert_eq!(to_channels_first_shape(nhwc), nchw);
        }
    }

    #[test]
    fn permutations_are_inverse() {
        let composed: Vec<usize> = TO_CHANNELS_FIRST
            .iter()
            .map(|&i| TO_CHANNELS_LAST[i])
            .collect();
        assert_eq!(composed, vec![0, 1, 2, 3]);
    }

    #[test]
    fn channel_axis_moves_last() {
        assert_eq!(channels_last_axis(1), 3);
        assert_eq!(channels_last_axis(2), 1);
        assert_eq!(channels_last_axis(3), 2);
        assert_eq!(channels_first_axis(3), 1);
    }

    #[test]
    fn layout_preserving_shapes() {
        assert!(layout_preserving(&[4, 3, 1, 1]));
        assert!(layout_preserving(&[1, 1, 16, 16]));
        assert!(!layout_preserving(&[1, 3, 2, 2]));
        assert!(!layout_preserving(&[3, 4]));
    }

    #[test]
    fn normalize_negative_axes() {
        assert_eq!(normalize_axis(-1, 4), Some(3));
        assert_eq!(normalize_axis(1, 4), Some(1));
        assert_eq!(normalize_axis(4, 4), None);
        assert_eq!(normalize_axis(-5, 4), None);
    }

    #[test]
    fn per_channel_constant_aligns_to_channels_last() {
        let c = ConstantValue::new(vec![1, 3, 1, 1], TensorData::F32(vec![1.0, 2.0, 3.0]));
        let aligned = align_constant(&c, DataFormat::InterleavedImageBatch);
        assert_eq!(aligned.shape, vec![1, 1, 1, 3]);
        assert_eq!(aligned.data, TensorData::F32(vec![1.0, 2.0, 3.0]));

        let c = ConstantValue::new(vec![3, 1, 1], TensorData::F32(vec![1.0, 2.0, 3.0]));
        assert_eq!(
            align_constant(&c, DataFormat::InterleavedImageBatch).shape,
            vec![1, 1, 1, 3]
        );
    }

    #[test]
    fn scalars_and_generic_constants_untouched() {
        let s = ConstantValue::scalar_f32(2.0);
        assert_eq!(align_constant(&s, DataFormat::InterleavedImageBatch), s);
        let v = ConstantValue::vector_f32(vec![1.0, 2.0]);
        assert_eq!(align_constant(&v, DataFormat::GenericTensor), v);
    }

    #[test]
    fn operand_reports_source_shape() {
        let img = Operand::Image {
            id: 0,
            shape: [1, 224, 224, 3],
        };
        assert_eq!(img.format(), DataFormat::InterleavedImageBatch);
        assert_eq!(img.source_shape(), vec![1, 3, 224, 224]);
        assert_eq!(img.shape(), vec![1, 224, 224, 3]);
        let k = Operand::constant(ConstantValue::scalar_f32(1.0));
        assert!(k.is_constant());
        assert_eq!(k.tensor_id(), None);
    }
}
