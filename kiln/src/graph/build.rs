//! Typed node constructors, with shape inference
use super::{
    BinaryOpcode, ClampRange, Conv2dParams, DataType, Graph, NodeId, Op,
    OutputPort, QuantParam, TensorType, UnaryOpcode, shape,
};
use crate::Error;

impl Graph {
    /// Creates a node, connects its inputs in order, and returns its first
    /// output port
    fn op_node(
        &mut self,
        op: Op,
        inputs: &[OutputPort],
        ty: TensorType,
    ) -> Result<OutputPort, Error> {
        let name = format!("{}_{}", op.opcode(), self.nodes.len());
        let node = self.add_node(op, name, vec![ty])?;
        for (i, p) in inputs.iter().enumerate() {
            self.connect(node.input(i), *p)?;
        }
        Ok(node.output(0))
    }

    fn check_dtype(
        &self,
        v: OutputPort,
        ok: impl Fn(DataType) -> bool,
        what: &str,
    ) -> Result<TensorType, Error> {
        let ty = self.output_type(v)?.clone();
        if ok(ty.dtype) {
            Ok(ty)
        } else {
            Err(Error::TypeMismatch(what.to_owned()))
        }
    }

    /// Declares a graph input
    pub fn input(
        &mut self,
        name: &str,
        ty: TensorType,
    ) -> Result<OutputPort, Error> {
        Ok(self.add_node(Op::Input, name, vec![ty])?.output(0))
    }

    /// Declares a graph output fed by `value`
    pub fn output(
        &mut self,
        name: &str,
        value: OutputPort,
    ) -> Result<NodeId, Error> {
        self.output_type(value)?;
        let node = self.add_node(Op::Output, name, vec![])?;
        self.connect(node.input(0), value)?;
        Ok(node)
    }

    /// Builds a constant node holding raw little-endian `data`
    pub fn constant(
        &mut self,
        ty: TensorType,
        data: Vec<u8>,
    ) -> Result<OutputPort, Error> {
        if data.len() != ty.bytes() {
            return Err(Error::TypeMismatch("constant".to_owned()));
        }
        self.op_node(Op::Constant(data), &[], ty)
    }

    /// Builds a constant `f32` tensor
    pub fn constant_f32(
        &mut self,
        dims: &[usize],
        values: &[f32],
    ) -> Result<OutputPort, Error> {
        let s = shape(dims).ok_or(Error::BadRank(dims.len()))?;
        let ty = TensorType::new(DataType::F32, s);
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.constant(ty, data)
    }

    /// Builds a transpose; `out.shape[i] = in.shape[perm[i]]`
    pub fn transpose(
        &mut self,
        value: OutputPort,
        perm: &[usize],
    ) -> Result<OutputPort, Error> {
        let ty = self.output_type(value)?.clone();
        let mut seen = vec![false; ty.rank()];
        if perm.len() != ty.rank()
            || !perm.iter().all(|&p| {
                p < seen.len() && !std::mem::replace(&mut seen[p], true)
            })
        {
            return Err(Error::BadPermutation(perm.to_vec()));
        }
        let out = perm.iter().map(|&p| ty.shape[p]).collect();
        let perm = perm.iter().copied().collect();
        self.op_node(
            Op::Transpose(perm),
            &[value],
            TensorType::new(ty.dtype, out),
        )
    }

    /// Builds a reshape, which must preserve the element count
    pub fn reshape(
        &mut self,
        value: OutputPort,
        dims: &[usize],
    ) -> Result<OutputPort, Error> {
        let ty = self.output_type(value)?.clone();
        let s = shape(dims).ok_or(Error::BadRank(dims.len()))?;
        let out = TensorType::new(ty.dtype, s.clone());
        if out.elements() != ty.elements() {
            return Err(Error::BadReshape(ty.elements(), out.elements()));
        }
        self.op_node(Op::Reshape(s), &[value], out)
    }

    pub fn unary(
        &mut self,
        op: UnaryOpcode,
        value: OutputPort,
    ) -> Result<OutputPort, Error> {
        let ty = self.output_type(value)?.clone();
        self.op_node(Op::Unary(op), &[value], ty)
    }

    /// Builds an elementwise binary operation
    ///
    /// Operands must have the same shape, or one of them must be a scalar.
    pub fn binary(
        &mut self,
        op: BinaryOpcode,
        a: OutputPort,
        b: OutputPort,
    ) -> Result<OutputPort, Error> {
        let ta = self.output_type(a)?;
        let tb = self.output_type(b)?;
        if ta.dtype != tb.dtype {
            return Err(Error::TypeMismatch(op.to_string()));
        }
        let ty = if ta.shape == tb.shape || tb.rank() == 0 {
            ta.clone()
        } else if ta.rank() == 0 {
            tb.clone()
        } else {
            return Err(Error::ShapeMismatch(
                ta.shape.to_vec(),
                tb.shape.to_vec(),
            ));
        };
        self.op_node(Op::Binary(op), &[a, b], ty)
    }

    pub fn clamp(
        &mut self,
        value: OutputPort,
        min: f32,
        max: f32,
    ) -> Result<OutputPort, Error> {
        let ty = self.output_type(value)?.clone();
        self.op_node(Op::Clamp(ClampRange::new(min, max)), &[value], ty)
    }

    /// Infers the output type of a convolution
    fn conv2d_type(
        &self,
        input: OutputPort,
        weights: OutputPort,
        bias: OutputPort,
        params: &Conv2dParams,
    ) -> Result<TensorType, Error> {
        let ti = self.output_type(input)?;
        let tw = self.output_type(weights)?;
        let tb = self.output_type(bias)?;
        if ti.rank() != 4 {
            return Err(Error::BadRank(ti.rank()));
        }
        if tw.rank() != 4 {
            return Err(Error::BadRank(tw.rank()));
        }
        let (n, c, h, w) = (ti.shape[0], ti.shape[1], ti.shape[2], ti.shape[3]);
        let (o, wc, kh, kw) = (tw.shape[0], tw.shape[1], tw.shape[2], tw.shape[3]);
        if c != wc || tb.shape.as_slice() != [o] {
            return Err(Error::ShapeMismatch(
                ti.shape.to_vec(),
                tw.shape.to_vec(),
            ));
        }
        let [sh, sw] = params.stride;
        let [ph, pw] = params.padding;
        if sh == 0 || sw == 0 || h + 2 * ph < kh || w + 2 * pw < kw {
            return Err(Error::ShapeMismatch(
                ti.shape.to_vec(),
                tw.shape.to_vec(),
            ));
        }
        let oh = (h + 2 * ph - kh) / sh + 1;
        let ow = (w + 2 * pw - kw) / sw + 1;
        Ok(TensorType::from_dims(ti.dtype, &[n, o, oh, ow]))
    }

    /// Builds a 2D convolution over an NCHW input with OIHW weights
    pub fn conv2d(
        &mut self,
        input: OutputPort,
        weights: OutputPort,
        bias: OutputPort,
        params: Conv2dParams,
    ) -> Result<OutputPort, Error> {
        self.check_dtype(input, |t| t == DataType::F32, "conv2d")?;
        let ty = self.conv2d_type(input, weights, bias, &params)?;
        self.op_node(Op::Conv2d(params), &[input, weights, bias], ty)
    }

    /// Builds a `[M, K] x [K, N]` matrix multiplication
    pub fn matmul(
        &mut self,
        a: OutputPort,
        b: OutputPort,
    ) -> Result<OutputPort, Error> {
        self.matmul_clamped(a, b, ClampRange::unbounded())
    }

    /// Builds a matrix multiplication with a fused output clamp
    pub fn matmul_clamped(
        &mut self,
        a: OutputPort,
        b: OutputPort,
        clamp: ClampRange,
    ) -> Result<OutputPort, Error> {
        let ta = self.output_type(a)?;
        let tb = self.output_type(b)?;
        if ta.rank() != 2 || tb.rank() != 2 || ta.shape[1] != tb.shape[0] {
            return Err(Error::ShapeMismatch(
                ta.shape.to_vec(),
                tb.shape.to_vec(),
            ));
        }
        let ty = TensorType::from_dims(ta.dtype, &[ta.shape[0], tb.shape[1]]);
        self.op_node(Op::MatMul(clamp), &[a, b], ty)
    }

    /// Converts a float tensor into a quantized one
    pub fn quantize(
        &mut self,
        value: OutputPort,
        param: QuantParam,
        dtype: DataType,
    ) -> Result<OutputPort, Error> {
        let ty = self.check_dtype(value, |t| t == DataType::F32, "quantize")?;
        if !dtype.is_quantized() {
            return Err(Error::TypeMismatch("quantize".to_owned()));
        }
        let out = TensorType::new(dtype, ty.shape);
        self.op_node(Op::Quantize(param, dtype), &[value], out)
    }

    /// Converts a quantized tensor back into floats
    pub fn dequantize(
        &mut self,
        value: OutputPort,
        param: QuantParam,
    ) -> Result<OutputPort, Error> {
        let ty =
            self.check_dtype(value, DataType::is_quantized, "dequantize")?;
        let out = TensorType::new(DataType::F32, ty.shape);
        self.op_node(Op::Dequantize(param), &[value], out)
    }

    /// Copies a quantized tensor into accelerator memory
    pub fn accel_upload(
        &mut self,
        value: OutputPort,
    ) -> Result<OutputPort, Error> {
        let ty =
            self.check_dtype(value, DataType::is_quantized, "accel_upload")?;
        self.op_node(Op::AccelUpload, &[value], ty)
    }

    /// Copies a tensor out of accelerator memory
    pub fn accel_download(
        &mut self,
        value: OutputPort,
    ) -> Result<OutputPort, Error> {
        let ty = self.output_type(value)?.clone();
        self.op_node(Op::AccelDownload, &[value], ty)
    }

    /// Builds a quantized convolution on the accelerator
    ///
    /// Only 1x1 and 3x3 kernels are available in hardware.
    pub fn accel_conv2d(
        &mut self,
        input: OutputPort,
        weights: OutputPort,
        bias: OutputPort,
        params: Conv2dParams,
    ) -> Result<OutputPort, Error> {
        self.check_dtype(input, DataType::is_quantized, "accel_conv2d")?;
        let kernel = &self.output_type(weights)?.shape;
        if kernel.len() != 4
            || kernel[2] != kernel[3]
            || !matches!(kernel[2], 1 | 3)
        {
            return Err(Error::TypeMismatch("accel_conv2d".to_owned()));
        }
        let ty = self.conv2d_type(input, weights, bias, &params)?;
        self.op_node(Op::AccelConv2d(params), &[input, weights, bias], ty)
    }
}

#[cfg(test)]
mod test {
    use crate::Error;
    use crate::graph::*;

    #[test]
    fn transpose_shapes() {
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::F32, &[1, 2, 3]))
            .unwrap();
        let t = g.transpose(x, &[2, 0, 1]).unwrap();
        assert_eq!(g.output_type(t).unwrap().shape.as_slice(), &[3, 1, 2]);
        assert!(matches!(
            g.transpose(x, &[0, 0, 1]),
            Err(Error::BadPermutation(..))
        ));
        assert!(matches!(
            g.transpose(x, &[0, 1]),
            Err(Error::BadPermutation(..))
        ));
        assert!(matches!(
            g.transpose(x, &[0, 1, 3]),
            Err(Error::BadPermutation(..))
        ));
    }

    #[test]
    fn conv2d_shapes() {
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::F32, &[1, 3, 8, 8]))
            .unwrap();
        let w = g.constant_f32(&[16, 3, 3, 3], &[0.0; 16 * 27]).unwrap();
        let b = g.constant_f32(&[16], &[0.0; 16]).unwrap();
        let params = Conv2dParams {
            stride: [2, 2],
            padding: [1, 1],
            ..Default::default()
        };
        let c = g.conv2d(x, w, b, params).unwrap();
        assert_eq!(g.output_type(c).unwrap().shape.as_slice(), &[1, 16, 4, 4]);

        let bad = g.constant_f32(&[16, 4, 3, 3], &[0.0; 16 * 36]).unwrap();
        assert!(matches!(
            g.conv2d(x, bad, b, params),
            Err(Error::ShapeMismatch(..))
        ));
    }

    #[test]
    fn binary_broadcast() {
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::F32, &[2, 2]))
            .unwrap();
        let s = g.constant_f32(&[], &[1.0]).unwrap();
        let y = g.binary(BinaryOpcode::Add, s, x).unwrap();
        assert_eq!(g.output_type(y).unwrap().shape.as_slice(), &[2, 2]);

        let z = g
            .input("z", TensorType::from_dims(DataType::F32, &[4]))
            .unwrap();
        assert!(g.binary(BinaryOpcode::Add, x, z).is_err());
        let r = g.reshape(z, &[2, 2]).unwrap();
        assert!(g.binary(BinaryOpcode::Mul, x, r).is_ok());
        assert!(matches!(g.reshape(z, &[3]), Err(Error::BadReshape(4, 3))));
    }

    #[test]
    fn quantize_types() {
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::F32, &[4]))
            .unwrap();
        let p = QuantParam::new(0.5, 128);
        let q = g.quantize(x, p, DataType::U8).unwrap();
        assert_eq!(g.output_type(q).unwrap().dtype, DataType::U8);
        assert!(g.quantize(q, p, DataType::U8).is_err());
        let d = g.dequantize(q, p).unwrap();
        assert_eq!(g.output_type(d).unwrap().dtype, DataType::F32);
        assert!(g.dequantize(d, p).is_err());
        let up = g.accel_upload(q).unwrap();
        assert_eq!(g.memory_kind(up).unwrap(), MemoryKind::Accelerator);
    }
}
