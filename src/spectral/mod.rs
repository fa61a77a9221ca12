//! Discrete pole representations of Green's functions and self-energies.
//!
//! A [`Lehmann`] object holds a set of poles and their couplings to a
//! physical orbital space. Self-energies are fitted from a finite sequence
//! of Hermitian spectral moments by block tridiagonalisation: the moments
//! are orthogonalised by the zeroth moment, a block Lanczos recursion
//! assembles the on- and off-diagonal blocks purely from moment algebra, and
//! the eigendecomposition of the resulting block-tridiagonal matrix yields
//! poles whose moments reproduce the input sequence. Green's functions
//! follow from the eigendecomposition of the Dyson supermatrix built from a
//! static potential and the self-energy poles.

use anyhow::{self, ensure};
use itertools::Itertools;
use ndarray::{s, Array1, Array2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use num_complex::Complex64;

#[cfg(test)]
#[path = "spectral_tests.rs"]
mod spectral_tests;

/// Relative eigenvalue cutoff for pseudo-inverting near-singular zeroth
/// moments and Lanczos off-diagonal blocks.
const NULL_SPACE_TOL: f64 = 1e-12;

/// A discrete pole representation in the Lehmann form
/// `F(z) = Σ_k v_k v_k† / (z - e_k)`.
#[derive(Clone, Debug)]
pub struct Lehmann {
    energies: Array1<f64>,
    couplings: Array2<Complex64>,
    chempot: f64,
}

impl Lehmann {
    /// Constructs a pole representation from energies, couplings of shape
    /// `(nphys, npoles)`, and a chemical potential separating the occupied
    /// and virtual sectors.
    pub fn new(
        energies: Array1<f64>,
        couplings: Array2<Complex64>,
        chempot: f64,
    ) -> Result<Self, anyhow::Error> {
        ensure!(
            energies.len() == couplings.ncols(),
            "Each pole requires one coupling column."
        );
        Ok(Self {
            energies,
            couplings,
            chempot,
        })
    }

    /// Number of physical orbitals the poles couple to.
    pub fn nphys(&self) -> usize {
        self.couplings.nrows()
    }

    /// Number of poles.
    pub fn npoles(&self) -> usize {
        self.energies.len()
    }

    /// The pole energies.
    pub fn energies(&self) -> &Array1<f64> {
        &self.energies
    }

    /// The pole couplings, shape `(nphys, npoles)`.
    pub fn couplings(&self) -> &Array2<Complex64> {
        &self.couplings
    }

    /// The chemical potential.
    pub fn chempot(&self) -> f64 {
        self.chempot
    }

    /// Moves the chemical potential.
    pub fn set_chempot(&mut self, chempot: f64) {
        self.chempot = chempot;
    }

    /// The squared coupling norm of each pole.
    pub fn weights(&self) -> Array1<f64> {
        Array1::from_iter(
            self.couplings
                .columns()
                .into_iter()
                .map(|v| v.iter().map(|x| x.norm_sqr()).sum()),
        )
    }

    /// The sub-representation of poles below the chemical potential.
    pub fn get_occupied(&self) -> Self {
        self.select(|e| e < self.chempot)
    }

    /// The sub-representation of poles at or above the chemical potential.
    pub fn get_virtual(&self) -> Self {
        self.select(|e| e >= self.chempot)
    }

    /// Prunes poles whose coupling weight falls below `tol`.
    pub fn remove_uncoupled(&self, tol: f64) -> Self {
        let weights = self.weights();
        let keep = weights
            .iter()
            .positions(|&w| w.sqrt() > tol)
            .collect_vec();
        self.take(&keep)
    }

    /// The `n`-th spectral moment `Σ_k e_k^n v_k v_k†`.
    pub fn moment(&self, n: usize) -> Array2<Complex64> {
        let weighted = &self.couplings
            * &self
                .energies
                .mapv(|e| Complex64::new(e.powi(n as i32), 0.0))
                .insert_axis(Axis(0));
        let couplings_h = self.couplings.t().mapv(|x| x.conj());
        weighted.dot(&couplings_h)
    }

    /// The spectral moments of order `0..=nmom_max`.
    pub fn moments(&self, nmom_max: usize) -> Vec<Array2<Complex64>> {
        (0..=nmom_max).map(|n| self.moment(n)).collect()
    }

    /// The single-particle density matrix `Σ_{e_k < μ} v_k v_k†` doubled for
    /// a spin-restricted system.
    pub fn occupied_weight(&self) -> f64 {
        2.0 * self.get_occupied().weights().sum()
    }

    /// Concatenates the poles of two representations sharing the same
    /// physical space, keeping this representation's chemical potential.
    pub fn concat(&self, other: &Self) -> Result<Self, anyhow::Error> {
        ensure!(
            self.nphys() == other.nphys(),
            "Pole representations to concatenate must share the orbital space."
        );
        let energies = ndarray::concatenate(
            Axis(0),
            &[self.energies.view(), other.energies.view()],
        )?;
        let couplings = ndarray::concatenate(
            Axis(1),
            &[self.couplings.view(), other.couplings.view()],
        )?;
        Self::new(energies, couplings, self.chempot)
    }

    fn select(&self, pred: impl Fn(f64) -> bool) -> Self {
        let keep = self.energies.iter().positions(|&e| pred(e)).collect_vec();
        self.take(&keep)
    }

    fn take(&self, keep: &[usize]) -> Self {
        Self {
            energies: self.energies.select(Axis(0), keep),
            couplings: self.couplings.select(Axis(1), keep),
            chempot: self.chempot,
        }
    }

    /// Fits a pole representation to a sequence of Hermitian spectral
    /// moments by block Lanczos tridiagonalisation.
    ///
    /// With `2L + 2` supplied moments the fit performs `L` block iterations
    /// and conserves the moments of order `0..=2L + 1`; a trailing
    /// odd-count moment is ignored. The zeroth moment may be singular, in
    /// which case its null space is projected out.
    pub fn from_moments(
        moments: &[Array2<Complex64>],
        chempot: f64,
    ) -> Result<Self, anyhow::Error> {
        ensure!(moments.len() >= 2, "At least two moments are required.");
        let nphys = moments[0].nrows();
        ensure!(
            moments.iter().all(|m| m.dim() == (nphys, nphys)),
            "All moments must be square and consistently sized."
        );
        let niter = (moments.len() - 2) / 2;
        let korder = 2 * niter + 1;

        let (shalf, sinv) = hermitian_sqrt_pair(&moments[0]);
        let m: Vec<Array2<Complex64>> = moments[..=korder]
            .iter()
            .map(|t| sinv.dot(t).dot(&sinv))
            .collect();

        // v[i][j][n] = Q_i† H^n Q_j over the block Krylov vectors; only the
        // entries with n + i + j <= korder are defined and needed.
        let nblk = niter + 2;
        let zero = Array2::<Complex64>::zeros((nphys, nphys));
        let mut v = vec![vec![vec![zero.clone(); korder + 1]; nblk]; nblk];
        for (n, mn) in m.iter().enumerate() {
            v[0][0][n] = mn.clone();
        }

        let mut a: Vec<Array2<Complex64>> = vec![v[0][0][1].clone()];
        let mut b: Vec<Array2<Complex64>> = vec![zero.clone()];

        for i in 0..niter {
            // Residual block overlap R† R from the three-term recurrence.
            let mut r2 = v[i][i][2].clone();
            r2 = r2 - v[i][i][1].dot(&a[i]) - a[i].dot(&v[i][i][1]) + a[i].dot(&a[i]);
            if i > 0 {
                let w1 = v[i][i - 1][1].clone();
                let w1_h = w1.t().mapv(|x| x.conj());
                r2 = r2 - w1.dot(&b[i]) - b[i].dot(&w1_h) + b[i].dot(&b[i]);
            }

            let (b_next, b_inv) = hermitian_sqrt_pair(&r2);

            // New row of Krylov overlaps, then its conjugate column, then
            // the new diagonal entry.
            let budget = korder.saturating_sub(i + 1);
            for j in 0..=i {
                for n in 0..=budget.saturating_sub(j) {
                    let mut t = v[i][j][n + 1].clone();
                    t = t - a[i].dot(&v[i][j][n]);
                    if i > 0 {
                        t = t - b[i].dot(&v[i - 1][j][n]);
                    }
                    v[i + 1][j][n] = b_inv.dot(&t);
                    v[j][i + 1][n] = v[i + 1][j][n].t().mapv(|x| x.conj());
                }
            }
            for n in 0..=budget.saturating_sub(i + 1) {
                let mut t = v[i][i + 1][n + 1].clone();
                t = t - a[i].dot(&v[i][i + 1][n]);
                if i > 0 {
                    t = t - b[i].dot(&v[i - 1][i + 1][n]);
                }
                v[i + 1][i + 1][n] = b_inv.dot(&t);
            }

            a.push(v[i + 1][i + 1][1].clone());
            b.push(b_next);
        }

        // Assemble and diagonalise the block tridiagonal matrix.
        let dim = (niter + 1) * nphys;
        let mut tri = Array2::<Complex64>::zeros((dim, dim));
        for (i, ai) in a.iter().enumerate().take(niter + 1) {
            tri.slice_mut(s![i * nphys..(i + 1) * nphys, i * nphys..(i + 1) * nphys])
                .assign(ai);
        }
        for i in 1..=niter {
            let bi = &b[i];
            let bi_h = bi.t().mapv(|x| x.conj());
            tri.slice_mut(s![i * nphys..(i + 1) * nphys, (i - 1) * nphys..i * nphys])
                .assign(bi);
            tri.slice_mut(s![(i - 1) * nphys..i * nphys, i * nphys..(i + 1) * nphys])
                .assign(&bi_h);
        }

        let (energies, eigvecs) = tri.eigh(UPLO::Lower)?;
        let couplings = shalf.dot(&eigvecs.slice(s![..nphys, ..]));

        Self::new(energies, couplings, chempot)
    }
}

/// The Hermitian square root of a positive-semidefinite matrix together with
/// the pseudo-inverse of that square root. Negative eigenvalues arising from
/// floating-point noise are clamped to zero; directions below the null-space
/// cutoff are projected out of the inverse.
fn hermitian_sqrt_pair(m: &Array2<Complex64>) -> (Array2<Complex64>, Array2<Complex64>) {
    let (eigvals, eigvecs) = m
        .eigh(UPLO::Lower)
        .expect("Hermitian eigendecomposition should not fail on finite input.");
    let cutoff = eigvals.iter().cloned().fold(0.0, f64::max) * NULL_SPACE_TOL;
    let sqrt_vals = eigvals.mapv(|e| if e > 0.0 { e.sqrt() } else { 0.0 });
    let inv_vals = eigvals.mapv(|e| if e > cutoff && e > 0.0 { 1.0 / e.sqrt() } else { 0.0 });
    let u_h = eigvecs.t().mapv(|x| x.conj());
    let sqrt = eigvecs
        .dot(&Array2::from_diag(
            &sqrt_vals.mapv(|x| Complex64::new(x, 0.0)),
        ))
        .dot(&u_h);
    let inv = eigvecs
        .dot(&Array2::from_diag(
            &inv_vals.mapv(|x| Complex64::new(x, 0.0)),
        ))
        .dot(&u_h);
    (sqrt, inv)
}

/// Diagonalises the Dyson supermatrix `[[F, V], [V†, diag(e)]]` of a static
/// potential and a self-energy pole representation, returning the resulting
/// Green's-function poles. Couplings are the physical-orbital rows of the
/// eigenvectors.
pub fn dyson_supermatrix(
    static_se: &Array2<Complex64>,
    se: &Lehmann,
) -> Result<Lehmann, anyhow::Error> {
    let nmo = static_se.nrows();
    ensure!(
        se.nphys() == nmo,
        "Static potential and self-energy must share the orbital space."
    );
    let naux = se.npoles();
    let dim = nmo + naux;

    let mut h = Array2::<Complex64>::zeros((dim, dim));
    h.slice_mut(s![..nmo, ..nmo]).assign(static_se);
    h.slice_mut(s![..nmo, nmo..]).assign(se.couplings());
    h.slice_mut(s![nmo.., ..nmo])
        .assign(&se.couplings().t().mapv(|x| x.conj()));
    for (k, &e) in se.energies().iter().enumerate() {
        h[(nmo + k, nmo + k)] = Complex64::new(e, 0.0);
    }

    let (energies, eigvecs) = h.eigh(UPLO::Lower)?;
    let couplings = eigvecs.slice(s![..nmo, ..]).to_owned();
    Lehmann::new(energies, couplings, se.chempot())
}

/// Finds the chemical potential of a Green's function that best reproduces
/// the target electron count, by scanning the pole ladder for the split
/// minimising the electron-count error. Returns the chemical potential and
/// the residual error.
pub fn binsearch_chempot(gf: &Lehmann, nelec: f64) -> (f64, f64) {
    let weights = gf.weights();
    let energies = gf.energies();
    let npoles = gf.npoles();

    let mut best_split = 0;
    let mut best_error = nelec.abs();
    let mut cum = 0.0;
    for split in 1..=npoles {
        cum += 2.0 * weights[split - 1];
        let error = (cum - nelec).abs();
        if error < best_error {
            best_error = error;
            best_split = split;
        }
    }

    let chempot = if npoles == 0 {
        0.0
    } else if best_split == 0 {
        energies[0] - 1.0
    } else if best_split == npoles {
        energies[npoles - 1] + 1.0
    } else {
        0.5 * (energies[best_split - 1] + energies[best_split])
    };
    (chempot, best_error)
}
