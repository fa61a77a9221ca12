//! Direct inversion in the iterative subspace.
//!
//! A bounded history of (vector, residual) pairs accelerates the fixed-point
//! iterations of the self-consistency drivers. Residuals are successive
//! differences of the supplied vectors; the extrapolation coefficients solve
//! the augmented least-squares system over the real part of the residual
//! overlaps. Each loop owns its own resettable buffer; a buffer is never
//! shared between loops.

use ndarray::{Array1, Array2, Array3, ArrayView1};
use ndarray_linalg::Solve;
use num_complex::Complex64;


/// A DIIS extrapolation buffer over complex k-stacked matrices.
#[derive(Clone, Debug)]
pub struct Diis {
    space: usize,
    vectors: Vec<Array3<Complex64>>,
    residuals: Vec<Array3<Complex64>>,
    last: Option<Array3<Complex64>>,
}

impl Diis {
    /// Constructs a buffer retaining at most `space` past iterations.
    pub fn new(space: usize) -> Self {
        Self {
            space: space.max(1),
            vectors: Vec::new(),
            residuals: Vec::new(),
            last: None,
        }
    }

    /// Discards the accumulated history.
    pub fn reset(&mut self) {
        self.vectors.clear();
        self.residuals.clear();
        self.last = None;
    }

    /// Number of stored (vector, residual) pairs.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Returns `true` if no history has been accumulated yet.
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Feeds the next trial vector into the history and returns the
    /// extrapolated estimate.
    ///
    /// Until two residuals are available, or when the augmented system turns
    /// out singular, the trial vector is returned unextrapolated.
    pub fn update(&mut self, x: Array3<Complex64>) -> Array3<Complex64> {
        let residual = match &self.last {
            None => {
                self.last = Some(x.clone());
                return x;
            }
            Some(prev) => &x - prev,
        };

        self.vectors.push(x.clone());
        self.residuals.push(residual);
        if self.vectors.len() > self.space {
            self.vectors.remove(0);
            self.residuals.remove(0);
        }

        let m = self.vectors.len();
        if m < 2 {
            self.last = Some(x.clone());
            return x;
        }

        // Augmented system: overlaps of residuals bordered by the
        // normalisation constraint.
        let mut aug = Array2::<f64>::zeros((m + 1, m + 1));
        for i in 0..m {
            for j in 0..m {
                aug[(i, j)] = real_overlap(
                    &self.residuals[i].view().into_shape(self.residuals[i].len()).unwrap(),
                    &self.residuals[j].view().into_shape(self.residuals[j].len()).unwrap(),
                );
            }
            aug[(i, m)] = 1.0;
            aug[(m, i)] = 1.0;
        }
        let mut rhs = Array1::<f64>::zeros(m + 1);
        rhs[m] = 1.0;

        let coeffs = match aug.solve_into(rhs) {
            Ok(sol) => sol,
            // Singular or ill-conditioned history: fall back to the raw
            // vector.
            Err(_) => {
                self.last = Some(x.clone());
                return x;
            }
        };

        let mut extrapolated = Array3::<Complex64>::zeros(x.dim());
        for (c, v) in coeffs.iter().take(m).zip(self.vectors.iter()) {
            extrapolated = extrapolated + v.mapv(|val| val * *c);
        }
        self.last = Some(extrapolated.clone());
        extrapolated
    }
}

/// `Re Σ conj(a) b` over flattened arrays.
fn real_overlap(a: &ArrayView1<Complex64>, b: &ArrayView1<Complex64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x.conj() * y).re).sum()
}
