use nalgebra::DMatrix;
use ordered_float::OrderedFloat;
use rayon::prelude::*;

/// Hierarchical density clustering over mutual-reachability distances.
///
/// Clusters are selected from the condensed tree by excess of mass; the root
/// is never selected, so data without any density split comes back as noise.
/// Noise is labelled `-1`, clusters `0..m` in order of first appearance in the
/// condensed tree.
///
/// Time is quadratic in the number of rows and memory linear: no distance
/// matrix is stored. Both quadratic sweeps (core distances and the spanning
/// tree) run on the current rayon pool. A single unit of 20 000 events costs
/// about 4·10⁸ distance evaluations per sweep, so callers splitting very large
/// units should subsample first.
#[derive(Clone, Debug)]
pub struct Hdbscan {
    pub min_cluster_size: usize,
    pub min_samples: usize,
}

impl Default for Hdbscan {
    fn default() -> Self {
        Hdbscan { min_cluster_size: 25, min_samples: 25 }
    }
}

#[derive(Clone, Copy, Debug)]
struct Merge {
    left: usize,
    right: usize,
    distance: f64,
    size: usize,
}

#[derive(Clone, Copy, Debug)]
struct CondensedEdge {
    parent: usize,
    child: usize,
    lambda: f64,
    size: usize,
}

impl Hdbscan {
    pub fn new(min_cluster_size: usize, min_samples: usize) -> Self {
        Hdbscan { min_cluster_size, min_samples }
    }

    /// Cluster the rows of `x`.
    pub fn fit(&self, x: &DMatrix<f64>) -> Vec<i64> {
        let n = x.nrows();
        let min_cluster_size = self.min_cluster_size.max(2);
        if n < 2 || n < min_cluster_size {
            return vec![-1; n];
        }
        let rows: Vec<Vec<f64>> = x.row_iter().map(|r| r.iter().copied().collect()).collect();

        let core = core_distances(&rows, self.min_samples.clamp(1, n));
        let edges = minimum_spanning_tree(&rows, &core);
        let hierarchy = single_linkage(n, &edges);
        let condensed = condense(&hierarchy, n, min_cluster_size);
        label_points(&condensed, n)
    }
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
}

/// distance to the k-th nearest neighbour, the point itself counting as the first
fn core_distances(rows: &[Vec<f64>], k: usize) -> Vec<f64> {
    rows.par_iter()
        .map(|a| {
            let mut d: Vec<f64> = rows.iter().map(|b| euclidean(a, b)).collect();
            let (_, kth, _) = d.select_nth_unstable_by_key(k - 1, |v| OrderedFloat(*v));
            *kth
        })
        .collect()
}

/// Prim's algorithm on the dense mutual-reachability graph; edges come back
/// sorted by weight. Each step relaxes the remaining points in parallel and
/// takes the closest one, lowest index first on ties.
fn minimum_spanning_tree(rows: &[Vec<f64>], core: &[f64]) -> Vec<(usize, usize, f64)> {
    let n = rows.len();
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut from = vec![0usize; n];
    let mut edges = Vec::with_capacity(n - 1);

    let mut current = 0;
    in_tree[0] = true;
    for _ in 1..n {
        let (row, core_current, done) = (&rows[current], core[current], &in_tree);
        let next = best
            .par_iter_mut()
            .zip(from.par_iter_mut())
            .enumerate()
            .filter(|(j, _)| !done[*j])
            .map(|(j, (b, f))| {
                let d = euclidean(row, &rows[j]).max(core_current).max(core[j]);
                if d < *b {
                    *b = d;
                    *f = current;
                }
                (OrderedFloat(*b), j)
            })
            .min();
        let Some((_, next)) = next else { break };
        edges.push((from[next], next, best[next]));
        in_tree[next] = true;
        current = next;
    }

    edges.sort_by_key(|e| OrderedFloat(e.2));
    edges
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    let mut root = x;
    while parent[root] != root {
        root = parent[root];
    }
    while parent[x] != root {
        let next = parent[x];
        parent[x] = root;
        x = next;
    }
    root
}

fn single_linkage(n: usize, edges: &[(usize, usize, f64)]) -> Vec<Merge> {
    let mut parent: Vec<usize> = (0..2 * n - 1).collect();
    let mut size = vec![1usize; 2 * n - 1];
    let mut out = Vec::with_capacity(n - 1);
    for &(a, b, distance) in edges {
        let ra = find(&mut parent, a);
        let rb = find(&mut parent, b);
        let node = n + out.len();
        parent[ra] = node;
        parent[rb] = node;
        size[node] = size[ra] + size[rb];
        out.push(Merge { left: ra, right: rb, distance, size: size[node] });
    }
    out
}

fn node_size(hierarchy: &[Merge], n: usize, node: usize) -> usize {
    if node < n {
        1
    } else {
        hierarchy[node - n].size
    }
}

/// nodes of the subtree under `root`, parents before children
fn subtree(hierarchy: &[Merge], n: usize, root: usize) -> Vec<usize> {
    let mut out = vec![root];
    let mut i = 0;
    while i < out.len() {
        let node = out[i];
        if node >= n {
            let m = hierarchy[node - n];
            out.push(m.left);
            out.push(m.right);
        }
        i += 1;
    }
    out
}

fn condense(hierarchy: &[Merge], n: usize, min_cluster_size: usize) -> Vec<CondensedEdge> {
    let root = 2 * n - 2;
    let mut relabel = vec![0usize; 2 * n - 1];
    let mut ignore = vec![false; 2 * n - 1];
    relabel[root] = n;
    let mut next_label = n + 1;
    let mut out = Vec::with_capacity(2 * n);

    for node in subtree(hierarchy, n, root) {
        if node < n || ignore[node] {
            continue;
        }
        let m = hierarchy[node - n];
        let lambda = 1.0 / m.distance.max(f64::EPSILON);
        let parent = relabel[node];
        let left_count = node_size(hierarchy, n, m.left);
        let right_count = node_size(hierarchy, n, m.right);

        let fall_out = |sub: usize, ignore: &mut [bool], out: &mut Vec<CondensedEdge>| {
            for d in subtree(hierarchy, n, sub) {
                if d < n {
                    out.push(CondensedEdge { parent, child: d, lambda, size: 1 });
                }
                ignore[d] = true;
            }
        };

        match (left_count >= min_cluster_size, right_count >= min_cluster_size) {
            (true, true) => {
                for (child, count) in [(m.left, left_count), (m.right, right_count)] {
                    relabel[child] = next_label;
                    out.push(CondensedEdge { parent, child: next_label, lambda, size: count });
                    next_label += 1;
                }
            }
            (false, false) => {
                fall_out(m.left, &mut ignore, &mut out);
                fall_out(m.right, &mut ignore, &mut out);
            }
            (false, true) => {
                relabel[m.right] = parent;
                fall_out(m.left, &mut ignore, &mut out);
            }
            (true, false) => {
                relabel[m.left] = parent;
                fall_out(m.right, &mut ignore, &mut out);
            }
        }
    }
    out
}

fn label_points(condensed: &[CondensedEdge], n: usize) -> Vec<i64> {
    let n_nodes = condensed.iter().map(|e| e.child.max(e.parent)).max().unwrap_or(n) + 1;
    let root = n;

    let mut birth = vec![0.0f64; n_nodes];
    let mut cluster_parent = vec![usize::MAX; n_nodes];
    let mut point_parent = vec![usize::MAX; n];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n_nodes];
    for e in condensed {
        if e.child >= n {
            birth[e.child] = e.lambda;
            cluster_parent[e.child] = e.parent;
            children[e.parent].push(e.child);
        } else {
            point_parent[e.child] = e.parent;
        }
    }

    let mut stability = vec![0.0f64; n_nodes];
    for e in condensed {
        stability[e.parent] += (e.lambda - birth[e.parent]) * e.size as f64;
    }

    // excess of mass, children before parents, root excluded
    let mut selected = vec![false; n_nodes];
    for c in (root + 1..n_nodes).rev() {
        selected[c] = true;
        let child_sum: f64 = children[c].iter().map(|&k| stability[k]).sum();
        if child_sum > stability[c] {
            selected[c] = false;
            stability[c] = child_sum;
        } else {
            let mut stack = children[c].clone();
            while let Some(k) = stack.pop() {
                selected[k] = false;
                stack.extend_from_slice(&children[k]);
            }
        }
    }

    let mut cluster_ids = vec![-1i64; n_nodes];
    let mut next = 0;
    for (c, id) in cluster_ids.iter_mut().enumerate().skip(root + 1) {
        if selected[c] {
            *id = next;
            next += 1;
        }
    }

    point_parent
        .iter()
        .map(|&p| {
            let mut c = p;
            while c != usize::MAX && c != root {
                if selected[c] {
                    return cluster_ids[c];
                }
                c = cluster_parent[c];
            }
            -1
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use statrs::distribution::Normal;
    use rand::distributions::Distribution;

    fn blob(rng: &mut ChaCha8Rng, n: usize, cx: f64, cy: f64) -> Vec<f64> {
        let normal = Normal::new(0.0, 1.0).unwrap();
        (0..n).flat_map(|_| [cx + normal.sample(rng), cy + normal.sample(rng)]).collect()
    }

    #[test]
    fn test_spanning_tree_matches_kruskal() {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let flat = blob(&mut rng, 120, 0.0, 0.0);
        let rows: Vec<Vec<f64>> = flat.chunks(2).map(|c| c.to_vec()).collect();
        let core = core_distances(&rows, 5);
        let tree = minimum_spanning_tree(&rows, &core);
        assert_eq!(tree.len(), rows.len() - 1);
        assert!(tree.windows(2).all(|w| w[0].2 <= w[1].2));

        let n = rows.len();
        let mut all: Vec<(usize, usize, f64)> = (0..n)
            .flat_map(|a| (a + 1..n).map(move |b| (a, b)))
            .map(|(a, b)| (a, b, euclidean(&rows[a], &rows[b]).max(core[a]).max(core[b])))
            .collect();
        all.sort_by_key(|e| OrderedFloat(e.2));
        let mut parent: Vec<usize> = (0..n).collect();
        let mut expected = 0.0;
        for (a, b, d) in all {
            let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
            if ra != rb {
                parent[ra] = rb;
                expected += d;
            }
        }
        let total: f64 = tree.iter().map(|e| e.2).sum();
        assert!((total - expected).abs() < 1e-9 * expected.max(1.0));
    }

    #[test]
    fn test_two_blobs_give_two_clusters() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut rows = blob(&mut rng, 200, 0.0, 0.0);
        rows.extend(blob(&mut rng, 200, 20.0, 0.0));
        let x = DMatrix::from_row_slice(400, 2, &rows);
        let labels = Hdbscan::new(25, 25).fit(&x);

        let mut found: Vec<i64> = labels.iter().copied().filter(|&l| l >= 0).collect();
        found.sort_unstable();
        found.dedup();
        assert_eq!(found, vec![0, 1]);

        // the blobs never share a label
        let first: Vec<i64> = labels[..200].iter().copied().filter(|&l| l >= 0).collect();
        let second: Vec<i64> = labels[200..].iter().copied().filter(|&l| l >= 0).collect();
        assert!(first.len() > 150 && second.len() > 150);
        assert!(first.iter().all(|&l| l == first[0]));
        assert!(second.iter().all(|&l| l == second[0]));
        assert_ne!(first[0], second[0]);
    }

    #[test]
    fn test_fewer_points_than_min_cluster_size_is_noise() {
        let x = DMatrix::from_row_slice(5, 1, &[0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(Hdbscan::new(25, 25).fit(&x), vec![-1; 5]);
    }

    #[test]
    fn test_single_linkage_sizes() {
        let edges = vec![(0, 1, 1.0), (2, 3, 1.5), (1, 2, 4.0)];
        let h = single_linkage(4, &edges);
        assert_eq!(h.len(), 3);
        assert_eq!(h[2].size, 4);
        assert_eq!(h[2].distance, 4.0);
    }
}
