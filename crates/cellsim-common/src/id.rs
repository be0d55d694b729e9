use std::fmt;

/// Simulated time index. Step `0` is the initial state; the first computed
/// step is `1`.
pub type Step = u64;

/// Stable handle of one node in the object graph.
///
/// Handles are never reused by the graph implementations in this workspace,
/// so a stale `NodeId` simply stops resolving after the node is deleted.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_display_and_index() {
        let id = NodeId::new(7);
        assert_eq!(id.as_index(), 7);
        assert_eq!(id.to_string(), "#7");
        assert_eq!(NodeId::from(7), id);
    }
}
