use super::{Target, fold, fuse, legalize};
use crate::{
    Error,
    graph::{
        DataType, Graph, MemoryKind, NodeAttributes, NodeId, Op, Opcode,
        OutputPort, QuantParam, TensorType,
    },
    schedule::{Aligned, Allocators, BufferAllocator, Tiled},
    transform::{
        Match, Pass, Transform, TransformContext,
        rules::{match_chain, match_single, producer_of, single_use},
    },
};
use enum_map::EnumMap;
use log::debug;

/// Default size of the accelerator scratchpad, in bytes
pub const DEFAULT_SCRATCHPAD: usize = 2 << 20;

/// Width of an accelerator memory row, in bytes
pub const TILE: usize = 64;

/// Quantizes a block of little-endian `f32` values to `u8`
fn quantize_bytes(data: &[u8], p: QuantParam) -> Vec<u8> {
    data.chunks_exact(4)
        .map(|c| {
            let mut b = [0u8; 4];
            b.copy_from_slice(c);
            let v = f32::from_le_bytes(b);
            let q = (v / p.scale.0).round() + p.zero_point as f32;
            q.clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// Moves a quantized convolution onto the accelerator
///
/// A [`Conv2d`](Op::Conv2d) marked with [`NodeAttributes::QUANTIZE`], whose
/// weights are constant and whose kernel is 1x1 or 3x3, becomes
/// `dequantize(download(accel_conv2d(upload(quantize(x)), w', b)))`, where
/// `w'` is a new constant holding the quantized weights.
pub struct LowerConv2dToAccel {
    pub param: QuantParam,
}

impl Transform for LowerConv2dToAccel {
    fn name(&self) -> &'static str {
        "lower_conv2d_to_accel"
    }

    fn opcodes(&self) -> &'static [Opcode] {
        &[Opcode::Conv2d]
    }

    fn on_try_match(
        &self,
        graph: &Graph,
        node: NodeId,
        ctx: &mut TransformContext,
    ) -> bool {
        let Ok(n) = graph.node(node) else {
            return false;
        };
        if !n.attributes().contains(NodeAttributes::QUANTIZE) {
            return false;
        }
        let Some((w, Op::Constant(..))) = producer_of(graph, node, 1) else {
            return false;
        };
        let Ok(wt) = graph.output_type(w) else {
            return false;
        };
        wt.dtype == DataType::F32
            && wt.rank() == 4
            && wt.shape[2] == wt.shape[3]
            && matches!(wt.shape[2], 1 | 3)
            && match_single(graph, node, ctx)
    }

    fn process(
        &self,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<Vec<OutputPort>, Error> {
        let Op::Conv2d(params) = *graph.node(m.node(0))?.op() else {
            return Err(Error::BadReplacement(self.name()));
        };
        let (x, w, b) = (m.producer(0), m.producer(1), m.producer(2));

        let Some(Op::Constant(data)) = graph.get_op(w.node) else {
            return Err(Error::BadReplacement(self.name()));
        };
        let data = quantize_bytes(data, self.param);
        let wt = TensorType::new(DataType::U8, graph.output_type(w)?.shape.clone());
        let w = graph.constant(wt, data)?;

        let q = graph.quantize(x, self.param, DataType::U8)?;
        let up = graph.accel_upload(q)?;
        let c = graph.accel_conv2d(up, w, b, params)?;
        let down = graph.accel_download(c)?;
        debug!("lowered {:?} onto the accelerator", m.node(0));
        Ok(vec![graph.dequantize(down, self.param)?])
    }
}

/// Rewrites `accel_upload(accel_download(x))` into `x`
pub struct FoldUploadDownload;

impl Transform for FoldUploadDownload {
    fn name(&self) -> &'static str {
        "fold_upload_download"
    }

    fn opcodes(&self) -> &'static [Opcode] {
        &[Opcode::AccelUpload]
    }

    fn on_try_match(
        &self,
        graph: &Graph,
        node: NodeId,
        ctx: &mut TransformContext,
    ) -> bool {
        let Some((d, Op::AccelDownload)) = producer_of(graph, node, 0) else {
            return false;
        };
        if !single_use(graph, d) {
            return false;
        }
        let Some((src, _)) = producer_of(graph, d.node, 0) else {
            return false;
        };
        // Only fold if the value never left accelerator memory
        graph.memory_kind(src).is_ok_and(|k| k == MemoryKind::Accelerator)
            && match_chain(graph, d.node, node, ctx)
    }

    fn process(
        &self,
        _graph: &mut Graph,
        m: &Match,
    ) -> Result<Vec<OutputPort>, Error> {
        Ok(vec![m.producer(0)])
    }
}

/// Host CPU paired with a quantized convolution accelerator
///
/// The accelerator has a fixed-size scratchpad, and pads the innermost
/// dimension of every tensor to a whole number of [`TILE`]-byte rows.
#[derive(Copy, Clone, Debug)]
pub struct AccelTarget {
    /// Scratchpad size, in bytes
    pub scratchpad: usize,
    /// Quantization parameters used when moving data to the accelerator
    pub param: QuantParam,
}

impl Default for AccelTarget {
    fn default() -> Self {
        Self {
            scratchpad: DEFAULT_SCRATCHPAD,
            param: QuantParam::new(1.0 / 32.0, 128),
        }
    }
}

impl AccelTarget {
    fn lower(&self) -> Pass {
        Pass::new("lower").with(LowerConv2dToAccel { param: self.param })
    }

    fn fold(&self) -> Pass {
        fold().with(FoldUploadDownload)
    }
}

impl Target for AccelTarget {
    fn name(&self) -> &'static str {
        "accel"
    }

    fn passes(&self) -> Vec<Pass> {
        vec![legalize(), self.fold(), fuse(), self.lower(), self.fold()]
    }

    fn allocators(&self) -> Allocators {
        Allocators(EnumMap::from_fn(|kind| {
            Some(match kind {
                MemoryKind::Accelerator => BufferAllocator::new(
                    kind,
                    Some(self.scratchpad),
                    Box::new(Tiled { tile: TILE }),
                ),
                k => BufferAllocator::new(k, None, Box::new(Aligned(8))),
            })
        }))
    }

    fn is_supported(&self, graph: &Graph, node: NodeId) -> bool {
        match graph.node(node) {
            Ok(n) => !(matches!(n.op(), Op::Conv2d(..))
                && n.attributes().contains(NodeAttributes::QUANTIZE)),
            Err(..) => false,
        }
    }
}
