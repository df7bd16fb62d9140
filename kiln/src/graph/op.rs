use crate::graph::types::{DataType, Permutation, Shape};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// A unary elementwise operation
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum UnaryOpcode {
    Abs,
    Neg,
    Exp,
    Sqrt,
    Relu,
}

/// A binary elementwise operation
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum BinaryOpcode {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

/// Output value range applied after a convolution or matrix multiply
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ClampRange {
    pub min: OrderedFloat<f32>,
    pub max: OrderedFloat<f32>,
}

impl ClampRange {
    /// The range which leaves every value unchanged
    pub fn unbounded() -> Self {
        Self::new(f32::NEG_INFINITY, f32::INFINITY)
    }

    pub fn new(min: f32, max: f32) -> Self {
        Self {
            min: OrderedFloat(min),
            max: OrderedFloat(max),
        }
    }

    /// Returns the range applying `self` then `other`
    pub fn intersect(&self, other: &ClampRange) -> Self {
        Self {
            min: self.min.max(other.min).min(other.max),
            max: self.max.min(other.max).max(other.min),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        *self == Self::unbounded()
    }
}

/// Affine quantization parameters, `real = (q - zero_point) * scale`
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct QuantParam {
    pub scale: OrderedFloat<f32>,
    pub zero_point: i32,
}

impl QuantParam {
    pub fn new(scale: f32, zero_point: i32) -> Self {
        Self {
            scale: OrderedFloat(scale),
            zero_point,
        }
    }
}

/// Convolution geometry shared by CPU and accelerator convolutions
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Conv2dParams {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub clamp: ClampRange,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            padding: [0, 0],
            clamp: ClampRange::unbounded(),
        }
    }
}

/// Opcode tag, used to index transform registries
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum Opcode {
    Input,
    Output,
    Constant,
    Transpose,
    Reshape,
    Unary,
    Binary,
    Clamp,
    Conv2d,
    MatMul,
    Quantize,
    Dequantize,
    AccelUpload,
    AccelDownload,
    AccelConv2d,
}

/// A single operation, along with its constructor arguments
///
/// Operands are not stored here; they live in the node's input ports.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Op {
    /// Graph input; one output
    Input,
    /// Declared graph output; one input, no outputs
    Output,
    /// Constant data; one output
    Constant(Vec<u8>),
    /// Permutes axes; `out.shape[i] = in.shape[perm[i]]`
    Transpose(Permutation),
    /// Reinterprets the input with a new shape
    Reshape(Shape),
    Unary(UnaryOpcode),
    Binary(BinaryOpcode),
    Clamp(ClampRange),
    /// NCHW input, OIHW weights, per-channel bias
    Conv2d(Conv2dParams),
    /// `[M, K] x [K, N]` with an optional fused clamp
    MatMul(ClampRange),
    /// Converts floats into the given quantized type
    Quantize(QuantParam, DataType),
    /// Converts quantized values back into `f32`
    Dequantize(QuantParam),
    /// Copies a tensor from main memory into accelerator memory
    AccelUpload,
    /// Copies a tensor from accelerator memory back into main memory
    AccelDownload,
    /// Quantized convolution running on the accelerator
    AccelConv2d(Conv2dParams),
}

impl Op {
    pub fn opcode(&self) -> Opcode {
        match self {
            Op::Input => Opcode::Input,
            Op::Output => Opcode::Output,
            Op::Constant(..) => Opcode::Constant,
            Op::Transpose(..) => Opcode::Transpose,
            Op::Reshape(..) => Opcode::Reshape,
            Op::Unary(..) => Opcode::Unary,
            Op::Binary(..) => Opcode::Binary,
            Op::Clamp(..) => Opcode::Clamp,
            Op::Conv2d(..) => Opcode::Conv2d,
            Op::MatMul(..) => Opcode::MatMul,
            Op::Quantize(..) => Opcode::Quantize,
            Op::Dequantize(..) => Opcode::Dequantize,
            Op::AccelUpload => Opcode::AccelUpload,
            Op::AccelDownload => Opcode::AccelDownload,
            Op::AccelConv2d(..) => Opcode::AccelConv2d,
        }
    }

    /// Number of input ports
    pub fn input_count(&self) -> usize {
        match self {
            Op::Input | Op::Constant(..) => 0,
            Op::Output
            | Op::Transpose(..)
            | Op::Reshape(..)
            | Op::Unary(..)
            | Op::Clamp(..)
            | Op::Quantize(..)
            | Op::Dequantize(..)
            | Op::AccelUpload
            | Op::AccelDownload => 1,
            Op::Binary(..) | Op::MatMul(..) => 2,
            Op::Conv2d(..) | Op::AccelConv2d(..) => 3,
        }
    }

    /// Number of output ports
    pub fn output_count(&self) -> usize {
        match self {
            Op::Output => 0,
            _ => 1,
        }
    }

    /// Short human-readable description, used in GraphViz output
    pub fn label(&self) -> String {
        match self {
            Op::Transpose(perm) => format!("transpose {:?}", perm.as_slice()),
            Op::Reshape(s) => format!("reshape {:?}", s.as_slice()),
            Op::Unary(op) => op.to_string(),
            Op::Binary(op) => op.to_string(),
            Op::Clamp(c) => format!("clamp [{}, {}]", c.min, c.max),
            op => op.opcode().to_string(),
        }
    }

    pub(crate) fn dot_node_color(&self) -> &str {
        match self {
            Op::Input | Op::Output => "red",
            Op::Constant(..) => "green",
            Op::AccelUpload | Op::AccelDownload | Op::AccelConv2d(..) => {
                "purple"
            }
            _ => "blue",
        }
    }

    pub(crate) fn dot_node_shape(&self) -> &str {
        match self {
            Op::Input | Op::Output => "circle",
            Op::Constant(..) => "oval",
            _ => "box",
        }
    }
}
