use super::{Buffer, Schedule};
use crate::{Error, graph::Graph};
use enum_map::EnumMap;

/// Finds a pair of conflicting buffers, if any exist
///
/// Buffers are swept in order of their first step; only buffers which are
/// still live at that step are compared.
pub(crate) fn find_conflict<'a, I>(buffers: I) -> Option<(&'a Buffer, &'a Buffer)>
where
    I: IntoIterator<Item = &'a Buffer>,
{
    let mut sorted: Vec<&Buffer> = buffers.into_iter().collect();
    sorted.sort_by_key(|b| (b.first, b.port));

    let mut live: EnumMap<_, Vec<&Buffer>> = EnumMap::default();
    for b in sorted {
        let active = &mut live[b.kind];
        active.retain(|a| a.last >= b.first);
        if let Some(a) = active.iter().find(|a| a.alloc.overlaps(&b.alloc)) {
            return Some((a, b));
        }
        active.push(b);
    }
    None
}

/// Checks that no two simultaneously live buffers of the same memory kind
/// share any bytes
///
/// Returns [`Error::OverlappingAllocations`] naming the two nodes involved.
pub fn verify(graph: &Graph, schedule: &Schedule) -> Result<(), Error> {
    match find_conflict(schedule.buffers.values()) {
        None => Ok(()),
        Some((a, b)) => {
            let name = |b: &Buffer| {
                graph
                    .node(b.port.node)
                    .map(|n| n.name().to_owned())
                    .unwrap_or_else(|_| format!("{:?}", b.port))
            };
            Err(Error::OverlappingAllocations(name(a), name(b), a.kind))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{DataType, MemoryKind, TensorType, UnaryOpcode};
    use crate::schedule::{Allocation, Allocators, schedule};

    #[test]
    fn detects_overlap() {
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::U8, &[8]))
            .unwrap();
        let a = g.unary(UnaryOpcode::Abs, x).unwrap();
        let b = g.unary(UnaryOpcode::Neg, a).unwrap();
        g.output("b", b).unwrap();
        g.set_name(a.node, "abs").unwrap();
        g.set_name(b.node, "neg").unwrap();

        let mut s = schedule(&g, Allocators::dense()).unwrap();
        verify(&g, &s).unwrap();

        // Corrupt the placement so that `a` and `b` collide
        s.buffers.get_mut(&b).unwrap().alloc = Allocation { offset: 4, size: 8 };
        match verify(&g, &s) {
            Err(Error::OverlappingAllocations(x, y, MemoryKind::Main)) => {
                assert_eq!((x.as_str(), y.as_str()), ("abs", "neg"));
            }
            r => panic!("unexpected result {r:?}"),
        }

        // Disjoint lifetimes may share addresses
        let bb = s.buffers.get_mut(&b).unwrap();
        bb.first = 3;
        verify(&g, &s).unwrap();
    }
}
