//! Consistent Hash Ring
//!
//! Maps client keys onto pool members through virtual nodes. Points are
//! derived from each member's address, so removing a member only moves
//! the keys that landed on its points.

/// Virtual nodes placed on the ring per member.
pub const DEFAULT_VIRTUAL_NODES: usize = 160;

/// Hash ring over the members of one pool.
///
/// Stores member indices, not members, so it can be rebuilt alongside
/// each registry snapshot and share its ordering.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// (point, member index) sorted by point
    points: Vec<(u32, usize)>,
    members: usize,
}

impl HashRing {
    /// Build a ring from member keys (typically `host:port`).
    pub fn new<'a, I>(keys: I, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut points = Vec::new();
        let mut members = 0;

        for (index, key) in keys.into_iter().enumerate() {
            members += 1;
            for vnode in 0..virtual_nodes.max(1) {
                let point = crc32fast::hash(format!("{}#{}", key, vnode).as_bytes());
                points.push((point, index));
            }
        }

        points.sort_unstable();
        Self { points, members }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of members the ring was built from.
    pub fn members(&self) -> usize {
        self.members
    }

    /// Member indices in clockwise order starting at the key's point.
    ///
    /// Each member appears once. Callers take the first index that is
    /// eligible, which keeps a key on the same member while membership
    /// and eligibility are unchanged.
    pub fn walk(&self, key: &str) -> impl Iterator<Item = usize> + '_ {
        let hash = crc32fast::hash(key.as_bytes());
        let start = self.points.partition_point(|(point, _)| *point < hash);
        let mut seen = vec![false; self.members];

        self.points[start..]
            .iter()
            .chain(self.points[..start].iter())
            .filter_map(move |(_, index)| {
                if seen[*index] {
                    None
                } else {
                    seen[*index] = true;
                    Some(*index)
                }
            })
    }

    /// First member on the ring for a key, ignoring eligibility.
    pub fn lookup(&self, key: &str) -> Option<usize> {
        self.walk(key).next()
    }
}
