//! The built-in linear least-squares predictor.
//!
//! Models the target as a linear combination of the feature vector and
//! refits from scratch on every added example by solving the normal
//! equations. A small ridge term keeps the system solvable while whole
//! feature columns are still zero (which is the common case here: most
//! regions touch one or two buffers, leaving the other slots empty).

/// An ordinary least-squares model over a fixed number of metrics.
pub struct Llsp {
    dims: usize,
    examples: Vec<Vec<f64>>,
    targets: Vec<f64>,
    coefficients: Option<Vec<f64>>,
}

/// Regularization added to the normal-equation diagonal. Negligible next
/// to real counter magnitudes, but it makes rank-deficient systems
/// well-posed.
const RIDGE: f64 = 1e-9;

impl Llsp {
    pub fn new(dims: usize) -> Llsp {
        Llsp {
            dims,
            examples: Vec::new(),
            targets: Vec::new(),
            coefficients: None,
        }
    }

    /// Append one training example.
    pub fn add(&mut self, features: &[f64], target: f64) {
        debug_assert_eq!(features.len(), self.dims);
        self.examples.push(features.to_vec());
        self.targets.push(target);
    }

    /// Recompute the coefficients from every example seen so far.
    pub fn solve(&mut self) {
        if self.examples.is_empty() {
            return;
        }

        let n = self.dims;

        // Normal equations: (XᵀX + λI) w = Xᵀy.
        let mut ata = vec![vec![0.0; n]; n];
        let mut aty = vec![0.0; n];
        for (x, &y) in self.examples.iter().zip(&self.targets) {
            for i in 0..n {
                for j in 0..n {
                    ata[i][j] += x[i] * x[j];
                }
                aty[i] += x[i] * y;
            }
        }
        for (i, row) in ata.iter_mut().enumerate() {
            row[i] += RIDGE;
        }

        if let Some(w) = gaussian_solve(ata, aty) {
            self.coefficients = Some(w);
        }
    }

    /// The current estimate for `features`; 0.0 until the first solve.
    pub fn predict(&self, features: &[f64]) -> f64 {
        match &self.coefficients {
            Some(w) => w.iter().zip(features).map(|(wi, xi)| wi * xi).sum(),
            None => 0.0,
        }
    }
}

/// Solve `a · w = b` by Gaussian elimination with partial pivoting.
/// `None` if the system is singular even after regularization.
fn gaussian_solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot][col].abs() < f64::EPSILON {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut w = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for col in row + 1..n {
            sum -= a[row][col] * w[col];
        }
        w[row] = sum / a[row][row];
    }
    Some(w)
}
