//! Arena storage addressed by typed handles

pub(crate) trait Index {
    fn new(i: usize) -> Self;
    fn get(&self) -> usize;
}

/// Append-only arena whose slots are addressed by a handle type `I`
///
/// Slots are never removed, so handles stay valid for the arena's lifetime;
/// the graph marks deleted nodes by storing `None`.  Handle types are built
/// with [define_index].
#[derive(Clone, Debug)]
pub(crate) struct IndexVec<V, I> {
    data: Vec<V>,
    _phantom: std::marker::PhantomData<fn(I)>,
}

impl<V, I> Default for IndexVec<V, I> {
    fn default() -> Self {
        Self {
            data: vec![],
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<V, I: Index> IndexVec<V, I> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Pushes a value, returning its index
    pub fn push(&mut self, v: V) -> I {
        let i = I::new(self.data.len());
        self.data.push(v);
        i
    }

    pub fn get(&self, i: I) -> Option<&V> {
        self.data.get(i.get())
    }

    pub fn get_mut(&mut self, i: I) -> Option<&mut V> {
        self.data.get_mut(i.get())
    }

    pub fn keys(&self) -> impl Iterator<Item = I> + use<V, I> {
        (0..self.data.len()).map(I::new)
    }

    pub fn iter(&self) -> impl Iterator<Item = (I, &V)> {
        self.data.iter().enumerate().map(|(i, v)| (I::new(i), v))
    }
}

impl<V, I> std::ops::Index<I> for IndexVec<V, I>
where
    I: Index,
{
    type Output = V;
    fn index(&self, i: I) -> &V {
        &self.data[i.get()]
    }
}

impl<V, I> std::ops::IndexMut<I> for IndexVec<V, I>
where
    I: Index,
{
    fn index_mut(&mut self, i: I) -> &mut V {
        &mut self.data[i.get()]
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Defines a `Copy` handle type for an [`IndexVec`]
macro_rules! define_index {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Copy,
            Clone,
            Default,
            Debug,
            Eq,
            PartialEq,
            Hash,
            Ord,
            PartialOrd,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name(usize);
        impl crate::graph::indexed::Index for $name {
            fn new(i: usize) -> Self {
                Self(i)
            }
            fn get(&self) -> usize {
                self.0
            }
        }
        impl $name {
            /// Returns the raw index
            pub fn get(&self) -> usize {
                self.0
            }
        }
    };
}
pub(crate) use define_index;
