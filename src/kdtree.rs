//! The k-d tree.
//!
//! Nodes live in an arena and refer to their children by index. The root is
//! always the first node.

use crate::{
    constants::{NDIM, PACKED_NODE_LEN, PLACEHOLDER_POINTS},
    error::{KdTreeError, Result},
    geometry::BoundingBox,
};

/// Index of a node in the arena of a [KdTree].
pub type NodeIndex = usize;

/// Number of `f64` values of a serialized node.
const FLAT_NODE_LEN: usize = 16;

/// A node of the tree.
#[derive(Clone, Debug, PartialEq)]
pub struct KdNode {
    /// The spatial region of the node.
    pub bounds: BoundingBox,
    /// The tight bounds of the points in the node.
    pub data_bounds: BoundingBox,
    /// The axis along which the node is divided, `None` for leaves.
    pub dim: Option<usize>,
    /// Number of points in the region. Placeholder nodes have a negative count.
    pub number_of_points: i64,
    /// The lower child.
    pub left: Option<NodeIndex>,
    /// The upper child.
    pub right: Option<NodeIndex>,
    /// The region id of a leaf of a finished tree.
    pub region_id: Option<usize>,
}

impl KdNode {
    /// A new undivided node.
    pub fn new(bounds: BoundingBox, data_bounds: BoundingBox, number_of_points: i64) -> Self {
        Self {
            bounds,
            data_bounds,
            dim: None,
            number_of_points,
            left: None,
            right: None,
            region_id: None,
        }
    }

    /// A node standing in for a node computed on another rank.
    pub fn placeholder() -> Self {
        Self::new(
            BoundingBox::placeholder(),
            BoundingBox::placeholder(),
            PLACEHOLDER_POINTS,
        )
    }

    /// True if the node has no children.
    pub fn is_leaf(&self) -> bool {
        self.left.is_none()
    }

    /// The children of an internal node.
    pub fn children(&self) -> Option<(NodeIndex, NodeIndex)> {
        self.left.zip(self.right)
    }
}

/// A binary space partition of a bounding box.
#[derive(Clone, Debug, PartialEq)]
pub struct KdTree {
    nodes: Vec<KdNode>,
    regions: Vec<NodeIndex>,
}

impl KdTree {
    /// A tree consisting of a single root node.
    pub fn new(bounds: BoundingBox, number_of_points: usize) -> Self {
        Self {
            nodes: vec![KdNode::new(bounds, bounds, number_of_points as i64)],
            regions: Vec::new(),
        }
    }

    /// Index of the root.
    pub fn root(&self) -> NodeIndex {
        0
    }

    /// The node at `index`.
    pub fn node(&self, index: NodeIndex) -> &KdNode {
        &self.nodes[index]
    }

    /// The node at `index`, mutable.
    pub fn node_mut(&mut self, index: NodeIndex) -> &mut KdNode {
        &mut self.nodes[index]
    }

    /// Number of nodes in the arena, including nodes no longer reachable from the root.
    pub fn arena_len(&self) -> usize {
        self.nodes.len()
    }

    /// Make room for two more nodes.
    pub fn reserve_children(&mut self) -> Result<()> {
        self.nodes
            .try_reserve(2)
            .map_err(|_| KdTreeError::Allocation {
                local: true,
                stage: "add child nodes",
            })
    }

    /// Attach two children to a leaf.
    pub fn add_children(
        &mut self,
        parent: NodeIndex,
        left: KdNode,
        right: KdNode,
    ) -> Result<(NodeIndex, NodeIndex)> {
        debug_assert!(self.nodes[parent].is_leaf());

        self.reserve_children()?;

        let left_index = self.nodes.len();
        self.nodes.push(left);
        self.nodes.push(right);

        let node = &mut self.nodes[parent];
        node.left = Some(left_index);
        node.right = Some(left_index + 1);

        Ok((left_index, left_index + 1))
    }

    /// Detach all descendants of `index`, making it a leaf.
    pub fn delete_all_descendants(&mut self, index: NodeIndex) {
        let node = &mut self.nodes[index];
        node.left = None;
        node.right = None;
        node.dim = None;
    }

    /// The nodes reachable from the root in preorder, left before right.
    pub fn preorder(&self) -> Vec<NodeIndex> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];

        while let Some(index) = stack.pop() {
            order.push(index);
            if let Some((left, right)) = self.nodes[index].children() {
                stack.push(right);
                stack.push(left);
            }
        }

        order
    }

    /// Number of levels below the root.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut stack = vec![(self.root(), 0)];

        while let Some((index, level)) = stack.pop() {
            depth = usize::max(depth, level);
            if let Some((left, right)) = self.nodes[index].children() {
                stack.push((left, level + 1));
                stack.push((right, level + 1));
            }
        }

        depth
    }

    /// Pad the tree with placeholder nodes until every leaf is at depth `depth`.
    pub fn fill_out(&mut self, depth: usize) -> Result<()> {
        let mut stack = vec![(self.root(), depth)];

        while let Some((index, remaining)) = stack.pop() {
            if remaining == 0 {
                continue;
            }

            let (left, right) = match self.nodes[index].children() {
                Some(children) => children,
                None => self.add_children(index, KdNode::placeholder(), KdNode::placeholder())?,
            };

            stack.push((left, remaining - 1));
            stack.push((right, remaining - 1));
        }

        Ok(())
    }

    /// Pack the split axis and the geometry of both children of `index`.
    pub fn pack_children(&self, index: NodeIndex) -> [f64; PACKED_NODE_LEN] {
        let mut data = [0.0; PACKED_NODE_LEN];
        let node = &self.nodes[index];
        let Some((left, right)) = node.children() else {
            return data;
        };
        let left = &self.nodes[left];
        let right = &self.nodes[right];

        data[0] = node.dim.map_or(NDIM as f64, |dim| dim as f64);
        data[1] = left.number_of_points as f64;
        data[2] = right.number_of_points as f64;

        let mut v = 3;
        for dim in 0..NDIM {
            for value in [
                left.bounds.min(dim),
                left.bounds.max(dim),
                left.data_bounds.min(dim),
                left.data_bounds.max(dim),
                right.bounds.min(dim),
                right.bounds.max(dim),
                right.data_bounds.min(dim),
                right.data_bounds.max(dim),
            ] {
                data[v] = value;
                v += 1;
            }
        }

        data
    }

    /// Inverse of [KdTree::pack_children].
    pub fn unpack_children(&mut self, index: NodeIndex, data: &[f64; PACKED_NODE_LEN]) {
        let Some((left, right)) = self.nodes[index].children() else {
            return;
        };

        let dim = data[0] as usize;
        self.nodes[index].dim = if dim < NDIM { Some(dim) } else { None };
        self.nodes[left].number_of_points = data[1] as i64;
        self.nodes[right].number_of_points = data[2] as i64;

        for dim in 0..NDIM {
            let values = &data[3 + 8 * dim..3 + 8 * (dim + 1)];

            let node = &mut self.nodes[left];
            node.bounds.set_min(dim, values[0]);
            node.bounds.set_max(dim, values[1]);
            node.data_bounds.set_min(dim, values[2]);
            node.data_bounds.set_max(dim, values[3]);

            let node = &mut self.nodes[right];
            node.bounds.set_min(dim, values[4]);
            node.bounds.set_max(dim, values[5]);
            node.data_bounds.set_min(dim, values[6]);
            node.data_bounds.set_max(dim, values[7]);
        }
    }

    /// Make the bounds of all children consistent with their parents.
    ///
    /// The outer faces of the children are set to those of the parent and the two
    /// children share their face on the split axis.
    pub fn check_fix_region_boundaries(&mut self) {
        for index in self.preorder() {
            let node = &self.nodes[index];
            let (Some((left, right)), Some(split)) = (node.children(), node.dim) else {
                continue;
            };
            let bounds = node.bounds;

            for dim in 0..NDIM {
                self.nodes[left].bounds.set_min(dim, bounds.min(dim));
                self.nodes[right].bounds.set_max(dim, bounds.max(dim));

                if dim == split {
                    let coord = self.nodes[right].bounds.min(dim);
                    self.nodes[left].bounds.set_max(dim, coord);
                } else {
                    self.nodes[left].bounds.set_max(dim, bounds.max(dim));
                    self.nodes[right].bounds.set_min(dim, bounds.min(dim));
                }
            }
        }
    }

    /// Drop unreachable nodes and store the remaining ones in preorder.
    pub fn compact(&mut self) {
        let order = self.preorder();
        let mut new_index = vec![usize::MAX; self.nodes.len()];
        for (position, &index) in order.iter().enumerate() {
            new_index[index] = position;
        }

        let nodes = order
            .iter()
            .map(|&index| {
                let mut node = self.nodes[index].clone();
                node.left = node.left.map(|child| new_index[child]);
                node.right = node.right.map(|child| new_index[child]);
                node
            })
            .collect();

        self.nodes = nodes;
        self.regions.clear();
    }

    /// Number the leaves depth first, left before right.
    ///
    /// Returns the number of regions.
    pub fn build_region_list(&mut self) -> usize {
        self.regions.clear();

        for index in self.preorder() {
            if self.nodes[index].is_leaf() {
                self.nodes[index].region_id = Some(self.regions.len());
                self.regions.push(index);
            } else {
                self.nodes[index].region_id = None;
            }
        }

        self.regions.len()
    }

    /// Number of leaf regions.
    pub fn number_of_regions(&self) -> usize {
        self.regions.len()
    }

    /// The leaf node of `region`.
    pub fn region(&self, region: usize) -> Result<&KdNode> {
        self.regions
            .get(region)
            .map(|&index| &self.nodes[index])
            .ok_or(KdTreeError::InvalidRegion(region))
    }

    /// The region ids of all leaves below `index`, left to right.
    pub fn leaf_region_ids(&self, index: NodeIndex) -> Vec<usize> {
        let mut ids = Vec::new();
        let mut stack = vec![index];

        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            match node.children() {
                Some((left, right)) => {
                    stack.push(right);
                    stack.push(left);
                }
                None => ids.extend(node.region_id),
            }
        }

        ids
    }

    /// The nodes at `level`, left to right. Leaves above `level` stand in for
    /// their missing descendants.
    pub fn regions_at_level(&self, level: usize) -> Vec<NodeIndex> {
        let mut nodes = Vec::new();
        let mut stack = vec![(self.root(), 0)];

        while let Some((index, depth)) = stack.pop() {
            match self.nodes[index].children() {
                Some((left, right)) if depth < level => {
                    stack.push((right, depth + 1));
                    stack.push((left, depth + 1));
                }
                _ => nodes.push(index),
            }
        }

        nodes
    }

    /// The region containing `point`, if the point lies in the tree.
    ///
    /// Regions are closed at their upper face, so points on a dividing plane
    /// belong to the lower region.
    pub fn region_containing_point(&self, point: [f64; 3]) -> Option<usize> {
        let mut index = self.root();
        if !self.nodes[index].bounds.contains(point) {
            return None;
        }

        loop {
            let node = &self.nodes[index];
            match (node.children(), node.dim) {
                (Some((left, right)), Some(dim)) => {
                    index = if point[dim] <= self.nodes[left].bounds.max(dim) {
                        left
                    } else {
                        right
                    };
                }
                _ => return node.region_id,
            }
        }
    }

    /// Regions in front to back order for a viewer looking along `direction`.
    pub fn view_order_regions_in_direction(&self, direction: [f64; 3]) -> Vec<usize> {
        self.view_order(|dim, _| direction[dim] >= 0.0)
    }

    /// Regions in front to back order for a viewer at `position`.
    pub fn view_order_regions_from_position(&self, position: [f64; 3]) -> Vec<usize> {
        self.view_order(|dim, coord| position[dim] < coord)
    }

    fn view_order(&self, lower_first: impl Fn(usize, f64) -> bool) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.regions.len());
        let mut stack = vec![self.root()];

        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            match (node.children(), node.dim) {
                (Some((left, right)), Some(dim)) => {
                    let coord = self.nodes[left].bounds.max(dim);
                    if lower_first(dim, coord) {
                        stack.push(right);
                        stack.push(left);
                    } else {
                        stack.push(left);
                        stack.push(right);
                    }
                }
                _ => order.extend(node.region_id),
            }
        }

        order
    }

    /// Serialize the nodes reachable from the root.
    pub fn to_flat(&self) -> Vec<f64> {
        let mut tree = self.clone();
        tree.compact();

        let encode = |index: Option<NodeIndex>| index.map_or(-1.0, |index| index as f64);

        let mut data = Vec::with_capacity(FLAT_NODE_LEN * tree.nodes.len());
        for node in &tree.nodes {
            data.extend_from_slice(&node.bounds.coordinates());
            data.extend_from_slice(&node.data_bounds.coordinates());
            data.push(node.dim.map_or(-1.0, |dim| dim as f64));
            data.push(node.number_of_points as f64);
            data.push(encode(node.left));
            data.push(encode(node.right));
        }

        data
    }

    /// Inverse of [KdTree::to_flat].
    pub fn from_flat(data: &[f64]) -> Result<Self> {
        if data.is_empty() || data.len() % FLAT_NODE_LEN != 0 {
            return Err(KdTreeError::CorruptTree);
        }

        let nnodes = data.len() / FLAT_NODE_LEN;
        let decode = |value: f64| -> Result<Option<NodeIndex>> {
            if value < 0.0 {
                Ok(None)
            } else if (value as usize) < nnodes {
                Ok(Some(value as usize))
            } else {
                Err(KdTreeError::CorruptTree)
            }
        };

        let nodes = data
            .chunks_exact(FLAT_NODE_LEN)
            .map(|chunk| {
                let mut bounds = [0.0; 6];
                let mut data_bounds = [0.0; 6];
                bounds.copy_from_slice(&chunk[0..6]);
                data_bounds.copy_from_slice(&chunk[6..12]);

                let dim = match chunk[12] {
                    value if value < 0.0 => None,
                    value if (value as usize) < NDIM => Some(value as usize),
                    _ => return Err(KdTreeError::CorruptTree),
                };

                Ok(KdNode {
                    bounds: BoundingBox::new(bounds),
                    data_bounds: BoundingBox::new(data_bounds),
                    dim,
                    number_of_points: chunk[13] as i64,
                    left: decode(chunk[14])?,
                    right: decode(chunk[15])?,
                    region_id: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if nodes.iter().any(|node| node.left.is_some() != node.right.is_some()) {
            return Err(KdTreeError::CorruptTree);
        }

        Ok(Self {
            nodes,
            regions: Vec::new(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::{KdNode, KdTree};
    use crate::{constants::PLACEHOLDER_POINTS, geometry::BoundingBox};

    /// A unit cube split along x, with the lower half split again along y.
    fn sample_tree() -> KdTree {
        let bounds = BoundingBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let mut tree = KdTree::new(bounds, 10);

        let (lower, upper) = bounds.split(0, 0.5);
        tree.node_mut(0).dim = Some(0);
        let (left, _) = tree
            .add_children(0, KdNode::new(lower, lower, 6), KdNode::new(upper, upper, 4))
            .unwrap();

        let (front, back) = lower.split(1, 0.25);
        tree.node_mut(left).dim = Some(1);
        tree.add_children(left, KdNode::new(front, front, 3), KdNode::new(back, back, 3))
            .unwrap();

        tree.build_region_list();
        tree
    }

    #[test]
    fn test_region_list_and_queries() {
        let tree = sample_tree();

        assert_eq!(tree.number_of_regions(), 3);
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.region(2).unwrap().number_of_points, 4);
        assert!(tree.region(3).is_err());

        assert_eq!(tree.region_containing_point([0.1, 0.1, 0.5]), Some(0));
        assert_eq!(tree.region_containing_point([0.1, 0.9, 0.5]), Some(1));
        assert_eq!(tree.region_containing_point([0.6, 0.1, 0.5]), Some(2));
        assert_eq!(tree.region_containing_point([0.5, 0.1, 0.5]), Some(0));
        assert_eq!(tree.region_containing_point([0.1, 0.25, 0.5]), Some(0));
        assert_eq!(tree.region_containing_point([1.0, 0.1, 0.5]), Some(2));
        assert_eq!(tree.region_containing_point([1.5, 0.1, 0.5]), None);

        assert_eq!(tree.leaf_region_ids(0), vec![0, 1, 2]);
        assert_eq!(tree.regions_at_level(1).len(), 2);
        assert_eq!(tree.regions_at_level(5).len(), 3);
    }

    #[test]
    fn test_view_order() {
        let tree = sample_tree();

        assert_eq!(tree.view_order_regions_in_direction([1.0, 1.0, 0.0]), vec![0, 1, 2]);
        assert_eq!(tree.view_order_regions_in_direction([-1.0, -1.0, 0.0]), vec![2, 1, 0]);
        assert_eq!(tree.view_order_regions_from_position([0.2, 0.9, 0.5]), vec![1, 0, 2]);
        assert_eq!(tree.view_order_regions_from_position([2.0, 0.0, 0.5]), vec![2, 0, 1]);
    }

    #[test]
    fn test_fill_out_and_delete() {
        let mut tree = sample_tree();

        tree.fill_out(2).unwrap();
        assert_eq!(tree.depth(), 2);
        let upper = tree.node(0).right.unwrap();
        let (left, _) = tree.node(upper).children().unwrap();
        assert_eq!(tree.node(left).number_of_points, PLACEHOLDER_POINTS);

        tree.delete_all_descendants(upper);
        tree.compact();
        assert_eq!(tree.arena_len(), 5);
        assert_eq!(tree.build_region_list(), 3);
    }

    #[test]
    fn test_pack_and_flat_roundtrip() {
        let mut tree = sample_tree();
        tree.compact();
        tree.build_region_list();

        let mut other = KdTree::new(tree.node(0).bounds, 10);
        other
            .add_children(0, KdNode::placeholder(), KdNode::placeholder())
            .unwrap();
        other.unpack_children(0, &tree.pack_children(0));
        assert_eq!(other.node(0).dim, Some(0));
        assert_eq!(other.node(1).bounds, tree.node(1).bounds);
        assert_eq!(other.node(2).number_of_points, 4);

        let mut restored = KdTree::from_flat(&tree.to_flat()).unwrap();
        restored.build_region_list();
        assert_eq!(restored, tree);

        assert!(KdTree::from_flat(&[0.0; 15]).is_err());
    }

    #[test]
    fn test_check_fix_region_boundaries() {
        let mut tree = sample_tree();
        let (left, right) = tree.node(0).children().unwrap();

        tree.node_mut(left).bounds.set_max(0, 0.4999);
        tree.node_mut(left).bounds.set_max(2, 0.9);
        tree.node_mut(right).bounds.set_min(1, 0.1);

        tree.check_fix_region_boundaries();

        assert_eq!(tree.node(left).bounds.max(0), 0.5);
        assert_eq!(tree.node(left).bounds.max(2), 1.0);
        assert_eq!(tree.node(right).bounds.min(1), 0.0);

        let volume: f64 = (0..tree.number_of_regions())
            .map(|region| tree.region(region).unwrap().bounds.volume())
            .sum();
        assert!((volume - 1.0).abs() < 1e-12);
    }
}
