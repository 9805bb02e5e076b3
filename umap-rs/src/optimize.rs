//! Stochastic gradient descent on the fuzzy set cross entropy. Position updates are applied
//! immediately and influence later updates within the same epoch, so the optimization runs on
//! a single thread and is fully determined by the seed.

use crate::Q;
use ndarray::Array2;
use rand::Rng;
use rand_pcg::Pcg64Mcg;

/// Optimizer state
pub struct State {
    pub move_other: bool,
    pub initial_alpha: Q,

    pub gamma: Q,
    pub a: Q,
    pub b: Q,

    pub n_epochs: usize,
    pub current_epoch: usize,

    pub head: Vec<usize>,
    pub tail: Vec<usize>,
    pub epochs_per_sample: Vec<Q>,
    pub epochs_per_negative_sample: Vec<Q>,

    pub alpha: Q,
    pub embedding: Array2<Q>,
    pub epoch_of_next_sample: Vec<Q>,
    pub epoch_of_next_negative_sample: Vec<Q>,

    random: Pcg64Mcg,
}

/// Parameters of the optimization that don't depend on the data
#[derive(Clone, Copy, Debug)]
pub struct Schedule {
    pub a: Q,
    pub b: Q,
    pub learning_rate: Q,
    pub repulsion_strength: Q,
    pub negative_sample_rate: usize,
    pub n_epochs: usize,
}

impl State {
    pub fn new(
        schedule: Schedule,
        embedding: Array2<Q>,
        head: Vec<usize>,
        tail: Vec<usize>,
        epochs_per_sample: Vec<Q>,
        random: Pcg64Mcg,
    ) -> State {
        let epochs_per_negative_sample = epochs_per_sample
            .iter()
            .map(|&e| e / (schedule.negative_sample_rate as Q))
            .collect::<Vec<_>>();

        State {
            move_other: true,
            initial_alpha: schedule.learning_rate,
            gamma: schedule.repulsion_strength,
            a: schedule.a,
            b: schedule.b,
            n_epochs: schedule.n_epochs,
            current_epoch: 0,
            head,
            tail,
            epoch_of_next_sample: epochs_per_sample.clone(),
            epochs_per_sample,
            epoch_of_next_negative_sample: epochs_per_negative_sample.clone(),
            epochs_per_negative_sample,
            alpha: schedule.learning_rate,
            embedding,
            random,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.head.len()
    }

    pub fn num_points(&self) -> usize {
        self.embedding.nrows()
    }

    pub fn optimize(&mut self) {
        while self.current_epoch < self.n_epochs {
            self.step();
        }
    }

    /// Run one epoch. Returns false once all epochs are done.
    pub fn step(&mut self) -> bool {
        if self.current_epoch >= self.n_epochs {
            return false;
        }
        for i in 0..self.epochs_per_sample.len() {
            self.iterate(i);
        }
        self.alpha = self.initial_alpha * (1.0 - (self.current_epoch as Q) / (self.n_epochs as Q));
        self.current_epoch += 1;
        true
    }

    pub fn into_embedding(self) -> Array2<Q> {
        self.embedding
    }

    fn iterate(&mut self, i: usize) {
        if self.epochs_per_sample[i] <= 0.0 || self.epoch_of_next_sample[i] > self.current_epoch as Q {
            return;
        }

        let j = self.head[i];
        let k = self.tail[i];
        let (a, b, gamma, alpha) = (self.a, self.b, self.gamma, self.alpha);
        let dim = self.embedding.ncols();

        let dist_sq = euclidean_sq(&self.embedding, j, k);
        let grad_coeff = if dist_sq > 0.0 {
            (-2.0 * a * b * dist_sq.powf(b - 1.0)) / (1.0 + a * dist_sq.powf(b))
        } else {
            0.0
        };

        for d in 0..dim {
            let current = self.embedding[[j, d]];
            let other = self.embedding[[k, d]];
            let grad_d = (grad_coeff * (current - other)).clamp(-4.0, 4.0);
            self.embedding[[j, d]] += grad_d * alpha;
            if self.move_other {
                self.embedding[[k, d]] -= grad_d * alpha;
            }
        }

        self.epoch_of_next_sample[i] += self.epochs_per_sample[i];

        let n_neg_samples =
            (self.current_epoch as Q - self.epoch_of_next_negative_sample[i]) / self.epochs_per_negative_sample[i];
        let n_points = self.embedding.nrows();

        for _ in 0..n_neg_samples.floor().max(0.0) as usize {
            let k = self.random.gen_range(0..n_points);
            if j == k {
                continue;
            }

            let dist_sq = euclidean_sq(&self.embedding, j, k);
            let grad_coeff = if dist_sq > 0.0 {
                (2.0 * gamma * b) / ((1e-3 + dist_sq) * (1.0 + a * dist_sq.powf(b)))
            } else {
                0.0
            };

            for d in 0..dim {
                let current = self.embedding[[j, d]];
                let other = self.embedding[[k, d]];
                let grad_d = if grad_coeff > 0.0 {
                    (grad_coeff * (current - other)).clamp(-4.0, 4.0)
                } else {
                    4.0
                };
                self.embedding[[j, d]] += grad_d * alpha;
            }
        }

        self.epoch_of_next_negative_sample[i] += n_neg_samples * self.epochs_per_negative_sample[i];
    }
}

/// Squared Euclidean distance
#[inline]
fn euclidean_sq(embedding: &Array2<Q>, j: usize, k: usize) -> Q {
    let x = embedding.row(j);
    let y = embedding.row(k);
    x.iter().zip(y).map(|(&x, &y)| x - y).fold(0.0, |acc, s| acc + s * s)
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    fn schedule(n_epochs: usize) -> Schedule {
        Schedule {
            a: 1.577,
            b: 0.895,
            learning_rate: 1.0,
            repulsion_strength: 1.0,
            negative_sample_rate: 5,
            n_epochs,
        }
    }

    #[test]
    fn test_attraction_pulls_neighbors_together() {
        // two linked points plus two far-away bystanders for negative sampling
        let emb = array![[0.0, 0.0], [5.0, 0.0], [50.0, 50.0], [-50.0, 50.0]];
        let before = euclidean_sq(&emb, 0, 1);
        let mut state = State::new(
            schedule(50),
            emb,
            vec![0, 1],
            vec![1, 0],
            vec![1.0, 1.0],
            Pcg64Mcg::seed_from_u64(0),
        );
        state.optimize();
        assert_eq!(state.current_epoch, 50);
        assert!(!state.step());
        let after = euclidean_sq(&state.embedding, 0, 1);
        assert!(after < before);
    }
}
