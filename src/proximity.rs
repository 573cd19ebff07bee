//! Spatio-temporal nearest-neighbour graph.
//!
//! Candidate pairs come from a uniform hash grid whose cell edge equals the
//! search radius, so every pair within `r_nn` sits in the same or an adjacent
//! cell. Small catalogs skip the grid and scan all pairs.

use std::collections::HashMap;

use log::debug;
use nalgebra::Vector3;
use serde::Serialize;

use crate::catalog::{CatalogStore, HypoId};
use crate::config::SearchParams;

/// Catalogs up to this size use the all-pairs scan under [`NeighborSearch::Auto`].
pub const BRUTE_FORCE_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NeighborSearch {
    #[default]
    Auto,
    Grid,
    BruteForce,
}

/// Undirected edge between two catalog events; `a` precedes `b` in catalog order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ProximityEdge {
    pub a: HypoId,
    pub b: HypoId,
}

/// Connected component of the proximity graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: usize,
    /// Catalog indices, ascending.
    pub members: Vec<usize>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ProximityGraph {
    search: SearchParams,
    ids: Vec<HypoId>,
    edges: Vec<(usize, usize)>,
    adjacency: Vec<Vec<usize>>,
}

impl ProximityGraph {
    pub fn build(catalog: &CatalogStore, search: SearchParams) -> Self {
        Self::build_with(catalog, search, NeighborSearch::Auto)
    }

    pub fn build_with(
        catalog: &CatalogStore,
        search: SearchParams,
        strategy: NeighborSearch,
    ) -> Self {
        let positions = catalog.positions();
        let hours = catalog.relative_hours();
        let test = PairTest::new(&positions, &hours, search);

        let use_grid = match strategy {
            NeighborSearch::Auto => positions.len() > BRUTE_FORCE_LIMIT,
            NeighborSearch::Grid => true,
            NeighborSearch::BruteForce => false,
        };

        let mut edges = if use_grid {
            grid_pairs(&positions, search.r_nn, &test)
        } else {
            brute_force_pairs(positions.len(), &test)
        };
        edges.sort_unstable();

        let mut adjacency = vec![Vec::new(); positions.len()];
        for &(i, j) in &edges {
            adjacency[i].push(j);
            adjacency[j].push(i);
        }

        debug!(
            "proximity graph r_nn={} dt_nn={}: {} events, {} edges ({})",
            search.r_nn,
            search.dt_nn,
            positions.len(),
            edges.len(),
            if use_grid { "grid" } else { "all pairs" }
        );

        Self {
            search,
            ids: catalog.hypocenters().iter().map(|h| h.id).collect(),
            edges,
            adjacency,
        }
    }

    pub fn search(&self) -> SearchParams {
        self.search
    }

    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Index pairs `(i, j)` with `i < j`, sorted.
    pub fn edge_indices(&self) -> &[(usize, usize)] {
        &self.edges
    }

    pub fn edges(&self) -> impl Iterator<Item = ProximityEdge> + '_ {
        self.edges.iter().map(|&(i, j)| ProximityEdge {
            a: self.ids[i],
            b: self.ids[j],
        })
    }

    pub fn neighbors(&self, idx: usize) -> &[usize] {
        &self.adjacency[idx]
    }

    pub fn degree(&self, idx: usize) -> usize {
        self.adjacency[idx].len()
    }

    /// All connected components, singletons included.
    ///
    /// Cluster ids follow the smallest catalog index of each component.
    pub fn clusters(&self) -> Vec<Cluster> {
        let mut sets = DisjointSet::new(self.node_count());
        for &(i, j) in &self.edges {
            sets.union(i, j);
        }

        let mut by_root: HashMap<usize, usize> = HashMap::new();
        let mut clusters: Vec<Cluster> = Vec::new();
        for idx in 0..self.node_count() {
            let root = sets.find(idx);
            let cluster_id = *by_root.entry(root).or_insert_with(|| {
                clusters.push(Cluster {
                    id: clusters.len(),
                    members: Vec::new(),
                });
                clusters.len() - 1
            });
            clusters[cluster_id].members.push(idx);
        }

        clusters
    }

    pub fn clusters_with_min_size(&self, min_size: usize) -> Vec<Cluster> {
        self.clusters()
            .into_iter()
            .filter(|cluster| cluster.len() >= min_size)
            .collect()
    }
}

struct PairTest<'a> {
    positions: &'a [Vector3<f64>],
    hours: &'a [f64],
    r_sq: f64,
    dt_nn: Option<f64>,
}

impl<'a> PairTest<'a> {
    fn new(positions: &'a [Vector3<f64>], hours: &'a [f64], search: SearchParams) -> Self {
        Self {
            positions,
            hours,
            r_sq: search.r_nn * search.r_nn,
            dt_nn: (!search.time_unbounded()).then_some(search.dt_nn),
        }
    }

    fn linked(&self, i: usize, j: usize) -> bool {
        if (self.positions[i] - self.positions[j]).norm_squared() > self.r_sq {
            return false;
        }
        match self.dt_nn {
            Some(dt_nn) => (self.hours[i] - self.hours[j]).abs() <= dt_nn,
            None => true,
        }
    }
}

fn brute_force_pairs(n: usize, test: &PairTest<'_>) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            if test.linked(i, j) {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

type CellKey = [i64; 3];

/// Cell index per axis. Coordinates far beyond the i64 range saturate into
/// the outermost cell, which the exact pair test still resolves.
fn cell_of(position: &Vector3<f64>, cell_size: f64) -> CellKey {
    [
        (position.x / cell_size).floor() as i64,
        (position.y / cell_size).floor() as i64,
        (position.z / cell_size).floor() as i64,
    ]
}

fn neighbour_cell([cx, cy, cz]: CellKey, [dx, dy, dz]: CellKey) -> Option<CellKey> {
    Some([cx.checked_add(dx)?, cy.checked_add(dy)?, cz.checked_add(dz)?])
}

fn grid_pairs(
    positions: &[Vector3<f64>],
    cell_size: f64,
    test: &PairTest<'_>,
) -> Vec<(usize, usize)> {
    let mut grid: HashMap<CellKey, Vec<usize>> = HashMap::new();
    for (idx, position) in positions.iter().enumerate() {
        grid.entry(cell_of(position, cell_size)).or_default().push(idx);
    }

    let mut pairs = Vec::new();
    for (i, position) in positions.iter().enumerate() {
        let cell = cell_of(position, cell_size);
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let Some(key) = neighbour_cell(cell, [dx, dy, dz]) else {
                        continue;
                    };
                    let Some(bucket) = grid.get(&key) else {
                        continue;
                    };
                    for &j in bucket {
                        if j > i && test.linked(i, j) {
                            pairs.push((i, j));
                        }
                    }
                }
            }
        }
    }
    pairs
}

/// Union-find with path halving and union by size.
struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, mut idx: usize) -> usize {
        while self.parent[idx] != idx {
            self.parent[idx] = self.parent[self.parent[idx]];
            idx = self.parent[idx];
        }
        idx
    }

    fn union(&mut self, a: usize, b: usize) {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::catalog::tests::hypo;
    use crate::config::DT_NN_UNBOUNDED;

    fn catalog(points: &[(f64, f64, f64, i64)]) -> CatalogStore {
        CatalogStore::new(
            points
                .iter()
                .enumerate()
                .map(|(idx, &(x, y, z, h))| hypo(idx as HypoId + 1, x, y, z, h))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn distant_events_are_never_linked() {
        let store = catalog(&[(0.0, 0.0, 0.0, 0), (150.0, 0.0, 0.0, 0)]);
        for dt_nn in [1.0, 48.0, DT_NN_UNBOUNDED, f64::INFINITY] {
            let graph = ProximityGraph::build(&store, SearchParams::new(100.0, dt_nn));
            assert_eq!(graph.edge_count(), 0, "dt_nn={dt_nn}");
        }
    }

    #[test]
    fn radius_and_window_are_inclusive() {
        let store = catalog(&[(0.0, 0.0, 0.0, 0), (100.0, 0.0, 0.0, 48)]);
        let graph = ProximityGraph::build(&store, SearchParams::new(100.0, 48.0));
        assert_eq!(
            graph.edges().collect::<Vec<_>>(),
            vec![ProximityEdge { a: 1, b: 2 }]
        );
    }

    #[test]
    fn time_window_cuts_spatial_neighbours() {
        let store = catalog(&[(0.0, 0.0, 0.0, 0), (10.0, 0.0, 0.0, 100)]);
        let graph = ProximityGraph::build(&store, SearchParams::new(100.0, 48.0));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn sentinel_window_keeps_centuries_apart_events() {
        let two_centuries = 24 * 365 * 200;
        let store = catalog(&[(0.0, 0.0, 0.0, 0), (10.0, 0.0, 0.0, two_centuries)]);
        let graph = ProximityGraph::build(&store, SearchParams::new(100.0, DT_NN_UNBOUNDED));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn clusters_follow_lowest_member() {
        let store = catalog(&[
            (1000.0, 0.0, 0.0, 0),
            (0.0, 0.0, 0.0, 0),
            (1050.0, 0.0, 0.0, 0),
            (50.0, 0.0, 0.0, 0),
            (5000.0, 0.0, 0.0, 0),
        ]);
        let graph = ProximityGraph::build(&store, SearchParams::spatial(100.0));
        let clusters = graph.clusters();
        assert_eq!(clusters.len(), 3);
        assert_eq!(clusters[0].members, vec![0, 2]);
        assert_eq!(clusters[1].members, vec![1, 3]);
        assert_eq!(clusters[2].members, vec![4]);
        assert!(graph.clusters_with_min_size(3).is_empty());
        assert_eq!(graph.degree(4), 0);
    }

    #[test]
    fn grid_handles_saturated_cell_keys() {
        let store = catalog(&[
            (1.0e18, 0.0, 0.0, 0),
            (1.0e18, 0.0, 0.0, 1),
            (-1.0e18, 0.0, 0.0, 0),
        ]);
        let search = SearchParams::spatial(1.0e-3);
        let grid = ProximityGraph::build_with(&store, search, NeighborSearch::Grid);
        let all_pairs = ProximityGraph::build_with(&store, search, NeighborSearch::BruteForce);
        assert_eq!(grid.edge_indices(), &[(0, 1)]);
        assert_eq!(grid.edge_indices(), all_pairs.edge_indices());
    }

    #[test]
    fn chains_join_into_one_cluster() {
        let store = catalog(&[
            (0.0, 0.0, 0.0, 0),
            (90.0, 0.0, 0.0, 0),
            (180.0, 0.0, 0.0, 0),
            (270.0, 0.0, 0.0, 0),
        ]);
        let graph = ProximityGraph::build(&store, SearchParams::spatial(100.0));
        assert_eq!(graph.edge_count(), 3);
        assert_eq!(graph.clusters_with_min_size(3)[0].members, vec![0, 1, 2, 3]);
    }

    fn point_strategy() -> impl Strategy<Value = Vec<(f64, f64, f64, i64)>> {
        prop::collection::vec(
            (0.0..1000.0f64, 0.0..1000.0f64, -500.0..0.0f64, 0i64..2000),
            2..80,
        )
    }

    proptest! {
        #[test]
        fn edges_grow_with_radius(
            points in point_strategy(),
            r in 10.0..300.0f64,
            extra in 0.0..300.0f64,
            dt in 1.0..500.0f64,
        ) {
            let store = catalog(&points);
            let small = ProximityGraph::build(&store, SearchParams::new(r, dt));
            let large = ProximityGraph::build(&store, SearchParams::new(r + extra, dt));
            prop_assert!(small.edge_count() <= large.edge_count());
        }

        #[test]
        fn grid_matches_all_pairs(
            points in point_strategy(),
            r in 10.0..300.0f64,
            dt in 1.0..500.0f64,
        ) {
            let store = catalog(&points);
            let search = SearchParams::new(r, dt);
            let grid = ProximityGraph::build_with(&store, search, NeighborSearch::Grid);
            let brute = ProximityGraph::build_with(&store, search, NeighborSearch::BruteForce);
            prop_assert_eq!(grid.edge_indices(), brute.edge_indices());
        }

        #[test]
        fn unbounded_window_is_purely_spatial(points in point_strategy(), r in 10.0..300.0f64) {
            let store = catalog(&points);
            let sentinel = ProximityGraph::build(&store, SearchParams::new(r, DT_NN_UNBOUNDED));
            let spatial = ProximityGraph::build(&store, SearchParams::spatial(r));
            let huge = ProximityGraph::build(&store, SearchParams::new(r, 1.0e12));
            prop_assert_eq!(sentinel.edge_indices(), spatial.edge_indices());
            prop_assert_eq!(sentinel.edge_indices(), huge.edge_indices());
        }
    }
}
