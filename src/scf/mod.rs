//! Mean-field reference data.
//!
//! The moment-constrained solvers consume the mean-field solution as an
//! opaque collaborator: orbital energies, coefficients and occupancies per
//! momentum point, the atomic-orbital overlap and core-Hamiltonian matrices,
//! and a density-matrix builder. How these were obtained is outside the
//! scope of this crate.

use anyhow::{self, ensure};
use ndarray::{Array1, Array2};
use num_complex::Complex64;

#[cfg(test)]
#[path = "scf_tests.rs"]
mod scf_tests;

/// A mean-field reference over a momentum mesh.
#[derive(Clone, Debug)]
pub struct KScfReference {
    mo_energy: Vec<Array1<f64>>,
    mo_coeff: Vec<Array2<Complex64>>,
    mo_occ: Vec<Array1<f64>>,
    ovlp: Vec<Array2<Complex64>>,
    hcore: Vec<Array2<Complex64>>,
}

impl KScfReference {
    /// Wraps mean-field data. `mo_coeff[k]` is `(nao, nmo)`; `ovlp` and
    /// `hcore` are `(nao, nao)` in the shared atomic-orbital basis.
    pub fn new(
        mo_energy: Vec<Array1<f64>>,
        mo_coeff: Vec<Array2<Complex64>>,
        mo_occ: Vec<Array1<f64>>,
        ovlp: Vec<Array2<Complex64>>,
        hcore: Vec<Array2<Complex64>>,
    ) -> Result<Self, anyhow::Error> {
        let nk = mo_energy.len();
        ensure!(nk > 0, "Mean-field data must cover at least one momentum point.");
        ensure!(
            [mo_coeff.len(), mo_occ.len(), ovlp.len(), hcore.len()]
                .iter()
                .all(|&n| n == nk),
            "Mean-field arrays must cover the same momentum points."
        );
        for k in 0..nk {
            let (nao, nmo) = mo_coeff[k].dim();
            ensure!(
                mo_energy[k].len() == nmo && mo_occ[k].len() == nmo,
                "Orbital energies and occupancies must match the orbital count at point {k}."
            );
            ensure!(
                ovlp[k].dim() == (nao, nao) && hcore[k].dim() == (nao, nao),
                "Overlap and core Hamiltonian must be square over the AO basis at point {k}."
            );
        }
        Ok(Self {
            mo_energy,
            mo_coeff,
            mo_occ,
            ovlp,
            hcore,
        })
    }

    /// Orbital energies per momentum point.
    pub fn mo_energy(&self) -> &[Array1<f64>] {
        &self.mo_energy
    }

    /// Orbital coefficients per momentum point.
    pub fn mo_coeff(&self) -> &[Array2<Complex64>] {
        &self.mo_coeff
    }

    /// Orbital occupancies per momentum point.
    pub fn mo_occ(&self) -> &[Array1<f64>] {
        &self.mo_occ
    }

    /// Atomic-orbital overlap matrices per momentum point.
    pub fn ovlp(&self) -> &[Array2<Complex64>] {
        &self.ovlp
    }

    /// Core-Hamiltonian matrices per momentum point.
    pub fn hcore(&self) -> &[Array2<Complex64>] {
        &self.hcore
    }

    /// Electron count per momentum point.
    pub fn nelec(&self) -> Vec<f64> {
        self.mo_occ.iter().map(|o| o.sum()).collect()
    }

    /// The reference density matrix in the atomic-orbital basis.
    pub fn make_rdm1(&self) -> Vec<Array2<Complex64>> {
        density_from_orbitals(&self.mo_coeff, &self.mo_occ)
    }
}

/// Builds the density matrix `C diag(occ) C†` per momentum point, in
/// whichever basis the coefficients are expressed in.
pub fn density_from_orbitals(
    coeff: &[Array2<Complex64>],
    occ: &[Array1<f64>],
) -> Vec<Array2<Complex64>> {
    coeff
        .iter()
        .zip(occ.iter())
        .map(|(c, o)| {
            let weighted = c * &o
                .mapv(|x| Complex64::new(x, 0.0))
                .insert_axis(ndarray::Axis(0));
            let c_h = c.t().mapv(|x| x.conj());
            weighted.dot(&c_h)
        })
        .collect()
}
