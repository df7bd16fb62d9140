use super::{Target, fold, fuse, legalize};
use crate::{
    graph::{Graph, MemoryKind, NodeId, Op},
    schedule::{Aligned, Allocators, BufferAllocator},
    transform::Pass,
};
use enum_map::EnumMap;

/// Buffer alignment on the host, in bytes
const ALIGN: usize = 8;

/// Host CPU target, with every buffer in unbounded host memory
#[derive(Copy, Clone, Debug, Default)]
pub struct CpuTarget;

impl Target for CpuTarget {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn passes(&self) -> Vec<Pass> {
        vec![legalize(), fold(), fuse()]
    }

    fn allocators(&self) -> Allocators {
        Allocators(EnumMap::from_fn(|kind| match kind {
            MemoryKind::Accelerator => None,
            k => Some(BufferAllocator::new(k, None, Box::new(Aligned(ALIGN)))),
        }))
    }

    fn is_supported(&self, graph: &Graph, node: NodeId) -> bool {
        !matches!(
            graph.get_op(node),
            None | Some(Op::AccelUpload | Op::AccelDownload | Op::AccelConv2d(..))
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pass_order() {
        let names: Vec<_> =
            CpuTarget.passes().iter().map(|p| p.name().to_owned()).collect();
        assert_eq!(names, ["legalize", "fold", "fuse"]);
    }

    #[test]
    fn memory_kinds() {
        let a = CpuTarget.allocators();
        assert!(a.0[MemoryKind::Accelerator].is_none());
        assert!(a.0[MemoryKind::Main].is_some());
        assert_eq!(a.capacities()[MemoryKind::Main], None);
    }
}
