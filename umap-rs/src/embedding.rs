use crate::Q;
use ndarray::{Array2, Axis};
use rand::Rng;
use sprs::CsMat;

/// Starting coordinates for the layout
#[derive(Clone, Debug)]
pub enum Init {
    /// uniform in `[-10, 10)` per coordinate
    Random,
    /// caller-provided coordinates (e.g. leading principal components), rescaled to `[-10, 10]`
    Given(Array2<Q>),
}

/// Initial embedding of `n_points` in `dim` dimensions
pub fn initialize_embedding(init: &Init, n_points: usize, dim: usize, random: &mut impl Rng) -> Array2<Q> {
    match init {
        Init::Given(coords) if coords.nrows() == n_points && coords.ncols() >= dim => {
            let mut emb = coords.slice(ndarray::s![.., ..dim]).to_owned();
            for mut col in emb.axis_iter_mut(Axis(1)) {
                let max = col.iter().fold(0.0 as Q, |m, &v| m.max(v.abs()));
                if max > 0.0 {
                    col.mapv_inplace(|v| 10.0 * v / max);
                }
            }
            emb
        }
        _ => Array2::from_shape_fn((n_points, dim), |_| random.gen_range(-10.0..10.0)),
    }
}

/// Turn the fuzzy graph into the edge list sampled by the optimizer: edges weaker than
/// `max / n_epochs` are dropped, the rest are shuffled, and each edge is sampled once every
/// `epochs_per_sample` epochs in proportion to its weight.
pub fn initialize_simplicial_set_embedding(
    graph: &CsMat<Q>,
    n_epochs: usize,
    random: &mut impl Rng,
) -> (Vec<usize>, Vec<usize>, Vec<Q>) {
    let n_epochs = n_epochs as Q;
    let mut weights = Vec::<Q>::new();
    let mut head = Vec::<usize>::new();
    let mut tail = Vec::<usize>::new();

    let graph_max = graph.iter().fold(0.0, |acc: Q, (&value, _)| acc.max(value));

    graph.iter().for_each(|(&value, (row, col))| {
        if value > 0.0 && value >= graph_max / n_epochs {
            weights.push(value);
            tail.push(row);
            head.push(col);
        }
    });

    shuffle_together(&mut head, &mut tail, &mut weights, random);

    (head, tail, make_epochs_per_sample(&weights, n_epochs))
}

fn shuffle_together<T: Copy, T2: Copy, T3: Copy>(
    list: &mut [T],
    other: &mut [T2],
    weights: &mut [T3],
    random: &mut impl Rng,
) {
    let mut n = list.len();
    assert_eq!(other.len(), n);
    while n > 1 {
        n -= 1;
        let k = random.gen_range(0..n + 1);
        list.swap(k, n);
        other.swap(k, n);
        weights.swap(k, n);
    }
}

fn make_epochs_per_sample(weights: &[Q], n_epochs: Q) -> Vec<Q> {
    let max = weights.iter().fold(Q::MIN, |a, &b| a.max(b));
    weights
        .iter()
        .map(|&w| {
            let n = (w / max) * n_epochs;
            if n > 0.0 {
                n_epochs / n
            } else {
                -1.0
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    #[test]
    fn test_epochs_per_sample() {
        let e = make_epochs_per_sample(&[1.0, 0.5, 0.25], 200.0);
        assert_eq!(e, vec![1.0, 2.0, 4.0]);
    }

    #[test]
    fn test_given_init_rescaled() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let pcs = array![[1.0, -4.0, 9.0], [-2.0, 2.0, 9.0]];
        let e = initialize_embedding(&Init::Given(pcs), 2, 2, &mut rng);
        assert_eq!(e, array![[5.0, -10.0], [-10.0, 5.0]]);
        let r = initialize_embedding(&Init::Random, 4, 2, &mut rng);
        assert!(r.iter().all(|v| v.abs() <= 10.0));
    }

    #[test]
    fn test_weak_edges_dropped() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let g: CsMat<Q> =
            sprs::TriMat::from_triplets((3, 3), vec![0, 1, 1, 2], vec![1, 0, 2, 1], vec![1.0, 1.0, 0.001, 0.001]).to_csr();
        let (head, tail, eps) = initialize_simplicial_set_embedding(&g, 10, &mut rng);
        assert_eq!(head.len(), 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(eps, vec![1.0, 1.0]);
    }
}
