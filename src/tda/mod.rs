//! Moments of the density-density response and their convolution into
//! self-energy moments.
//!
//! The density-density response is treated in the Tamm–Dancoff approximation
//! and never diagonalised: only its spectral moments are built, by a
//! recursion over momentum-conserving tuples of the mesh. The moments are
//! then convolved with the Green's-function pole energies through a
//! binomial-weighted sum, which yields the occupied and virtual moments of
//! the self-energy without evaluating a single energy-dependent integral.

use std::ops::AddAssign;

use anyhow::{self, ensure};
use ndarray::{s, Array1, Array2, Array3, Array4, Axis};
use ndarray_linalg::Norm;
use num_complex::Complex64;

use crate::error::McGwError;
use crate::ints::{DensityFittingProvider, KIntegrals};
use crate::parallel::{allreduce_sum, CollectiveOps};


/// Relative tolerance of the self-energy moment Hermiticity gate.
const HERMITICITY_TOL: f64 = 1e-8;

/// Moments of the density-density response, indexed as `[q][k][order]` with
/// each entry an `(aux, occ × vir)` matrix for the momentum transfer `q` and
/// final momentum point `k`.
pub type DdMoments = Vec<Vec<Vec<Array2<Complex64>>>>;

/// Builder for the moments of the density-density response and of the
/// self-energy within the Tamm–Dancoff approximation.
pub struct TdaSolver<'a, 'b, P: DensityFittingProvider> {
    integrals: &'b KIntegrals<'a, P>,
    nmom_max: usize,
    mo_energy_g: Vec<Array1<f64>>,
    mo_occ_g: Vec<Array1<f64>>,
    mo_energy_w: Vec<Array1<f64>>,
    mo_occ_w: Vec<Array1<f64>>,
    diagonal_se: bool,
}

impl<'a, 'b, P: DensityFittingProvider> TdaSolver<'a, 'b, P> {
    /// Constructs a moment builder over transformed integrals.
    ///
    /// `mo_energy` and `mo_occ` are used for both the Green's-function and
    /// the screened-interaction bases; use [`Self::set_g_basis`] and
    /// [`Self::set_w_basis`] when the two differ.
    pub fn new(
        integrals: &'b KIntegrals<'a, P>,
        nmom_max: usize,
        mo_energy: Vec<Array1<f64>>,
        mo_occ: Vec<Array1<f64>>,
    ) -> Result<Self, anyhow::Error> {
        let nk = integrals.kpts().len();
        ensure!(
            mo_energy.len() == nk && mo_occ.len() == nk,
            "Orbital energies and occupancies must cover every momentum point."
        );
        Ok(Self {
            integrals,
            nmom_max,
            mo_energy_g: mo_energy.clone(),
            mo_occ_g: mo_occ.clone(),
            mo_energy_w: mo_energy,
            mo_occ_w: mo_occ,
            diagonal_se: false,
        })
    }

    /// Overrides the orbital energies and occupancies of the
    /// Green's-function basis.
    pub fn set_g_basis(&mut self, mo_energy: Vec<Array1<f64>>, mo_occ: Vec<Array1<f64>>) {
        self.mo_energy_g = mo_energy;
        self.mo_occ_g = mo_occ;
    }

    /// Overrides the orbital energies and occupancies of the
    /// screened-interaction basis.
    pub fn set_w_basis(&mut self, mo_energy: Vec<Array1<f64>>, mo_occ: Vec<Array1<f64>>) {
        self.mo_energy_w = mo_energy;
        self.mo_occ_w = mo_occ;
    }

    /// Restricts the self-energy convolution to the diagonal of the
    /// per-pole tensor. Cheaper, but loses the off-diagonal self-energy
    /// coupling.
    pub fn set_diagonal_se(&mut self, diagonal_se: bool) {
        self.diagonal_se = diagonal_se;
    }

    /// The maximum moment order.
    pub fn nmom_max(&self) -> usize {
        self.nmom_max
    }

    /// Builds the moments of the density-density response by recursion.
    ///
    /// The zeroth moment at `(q, k)` is the `Lia` block of the pair related
    /// by `q`, normalised by the mesh size. Each higher order adds the
    /// energy-denominator term (the previous moment weighted elementwise by
    /// the virtual-minus-occupied orbital-energy differences) and the
    /// coupling term, a contraction over every momentum-conserving triple
    /// scaled by `2 / N_k`. The triple loop dominates the cost of the whole
    /// pipeline and is sharded across workers, with an all-reduce of the
    /// accumulated coupling contributions at every order.
    pub fn build_dd_moments<C: CollectiveOps>(
        &self,
        ops: &C,
    ) -> Result<DdMoments, anyhow::Error> {
        log::info!("Building density-density moments");

        let kpts = self.integrals.kpts();
        let nk = kpts.len();
        let naux = self.integrals.naux();
        let nocc_w = self.integrals.nocc_w();
        let nvir_w = self.integrals.nvir_w();
        let lia = self.integrals.lia();
        let lai = self.integrals.lai();

        let mut moments: DdMoments = (0..nk)
            .map(|q| {
                (0..nk)
                    .map(|kb| {
                        let kj = kpts.diff(kb, q).map(|kj| {
                            Array2::zeros((naux[q], nocc_w[kj] * nvir_w[kb]))
                        });
                        match kj {
                            Ok(zero) => vec![zero; self.nmom_max + 1],
                            Err(_) => Vec::new(),
                        }
                    })
                    .collect()
            })
            .collect();

        // Zeroth order.
        for pair in kpts.conserving_pairs() {
            let (q, kb, kj) = (pair.q, pair.k, pair.k_minus_q);
            moments[q][kb][0].add_assign(&lia[&(kj, kb)].mapv(|x| x / nk as f64));
        }

        // Higher orders.
        for order in 1..=self.nmom_max {
            for pair in kpts.conserving_pairs() {
                let (q, kb, kj) = (pair.q, pair.k, pair.k_minus_q);

                // Energy-denominator term, broadcast over the flattened
                // occupied x virtual index.
                let d = energy_differences(
                    &self.mo_energy_w[kj],
                    &self.mo_occ_w[kj],
                    &self.mo_energy_w[kb],
                    &self.mo_occ_w[kb],
                );
                let prev = moments[q][kb][order - 1].clone();
                let mut next = prev;
                for mut row in next.rows_mut() {
                    row.zip_mut_with(&d, |m, &e| *m *= e);
                }
                moments[q][kb][order].add_assign(&next);
            }

            // Coupling term over momentum-conserving triples, sharded across
            // workers and summed collectively.
            let mut coupling: Vec<Vec<Array2<Complex64>>> = (0..nk)
                .map(|q| {
                    (0..nk)
                        .map(|kb| {
                            let dim = moments[q][kb]
                                .first()
                                .map(|m| m.dim())
                                .unwrap_or((0, 0));
                            Array2::zeros(dim)
                        })
                        .collect()
                })
                .collect();
            for triple in kpts.conserving_triples_sharded(ops) {
                let (q, ka, kb) = (triple.q, triple.ka, triple.kb);
                let (ki, kj) = (triple.ka_minus_q, triple.kb_minus_q);

                let lia_h = lia[&(ki, ka)].t().mapv(|x| x.conj());
                let lai_c = lai[&(kj, kb)].mapv(|x| x.conj());
                let term = moments[q][ka][order - 1]
                    .dot(&lia_h)
                    .dot(&lai_c)
                    .mapv(|x| x * 2.0 / nk as f64);
                coupling[q][kb].add_assign(&term);
            }
            for row in coupling.iter_mut() {
                for acc in row.iter_mut() {
                    allreduce_sum(ops, acc);
                }
            }
            for pair in kpts.conserving_pairs() {
                let (q, kb) = (pair.q, pair.k);
                let acc = std::mem::take(&mut coupling[q][kb]);
                moments[q][kb][order].add_assign(&acc);
            }

            log::debug!("Built density-density moment {order}");
        }

        Ok(moments)
    }

    /// The exact construction of the density-density moments by
    /// diagonalisation of the full response matrix. Not implemented; callers
    /// must not rely on this path.
    pub fn build_dd_moments_exact(&self) -> Result<DdMoments, anyhow::Error> {
        Err(McGwError::unimplemented_exact_dd().into())
    }

    /// Convolves the density-density moments into the occupied and virtual
    /// moments of the self-energy.
    ///
    /// The response moments are first rotated into the auxiliary-pair
    /// representation, then weighted per Green's-function pole with `Lpx`
    /// contractions, and finally combined over poles with binomial
    /// coefficients: poles below the chemical potential carry alternating
    /// signs, poles above unsigned weights. The result must be Hermitian;
    /// any violation beyond the gate tolerance is fatal, and the surviving
    /// floating-point asymmetry is symmetrised away.
    pub fn build_se_moments(
        &self,
        moments_dd: &DdMoments,
    ) -> Result<(Vec<Array3<Complex64>>, Vec<Array3<Complex64>>), anyhow::Error> {
        log::info!("Building self-energy moments");

        let kpts = self.integrals.kpts();
        let nk = kpts.len();
        let nmo = self.integrals.nmo();
        let nmom = self.nmom_max;
        let lia = self.integrals.lia();
        let lpx = self.integrals.lpx();

        // Per-pole moment tensors in the orbital representation, indexed by
        // [kp][q] with shape (poles at kx, order, nmo, nmo).
        let mut eta: Vec<Vec<Array4<Complex64>>> = (0..nk)
            .map(|kp| {
                (0..nk)
                    .map(|q| {
                        let kx = kpts
                            .diff(kp, q)
                            .expect("Conserving pair in self-energy rotation.");
                        Array4::zeros((self.mo_energy_g[kx].len(), nmom + 1, nmo, nmo))
                    })
                    .collect()
            })
            .collect();

        for order in 0..=nmom {
            for q in 0..nk {
                let naux_q = self.integrals.naux()[q];
                let mut eta_aux: Array2<Complex64> = Array2::zeros((naux_q, naux_q));
                for pair in kpts.conserving_pairs().filter(|p| p.q == q) {
                    let (kb, kj) = (pair.k, pair.k_minus_q);
                    let lia_h = lia[&(kj, kb)].t().mapv(|x| x.conj());
                    eta_aux.add_assign(&moments_dd[q][kb][order].dot(&lia_h));
                }

                for kp in 0..nk {
                    let kx = kpts.diff(kp, q)?;
                    let lpx_k = &lpx[&(kp, kx)];
                    for x in 0..self.mo_energy_g[kx].len() {
                        let lp = lpx_k.slice(s![.., .., x]);
                        let lp_c = lp.mapv(|v| v.conj());
                        let mut val = lp
                            .t()
                            .dot(&eta_aux)
                            .dot(&lp_c)
                            .mapv(|v| v * 2.0 / nk as f64);
                        if self.diagonal_se {
                            let diag = Array2::from_diag(&val.diag().to_owned());
                            val = diag;
                        }
                        eta[kp][q]
                            .slice_mut(s![x, order, .., ..])
                            .add_assign(&val);
                    }
                }
            }
        }
        log::debug!("Rotated density-density moments into the orbital basis");

        // Binomial convolution over the Green's-function poles.
        let mut moments_occ: Vec<Array3<Complex64>> =
            vec![Array3::zeros((nmom + 1, nmo, nmo)); nk];
        let mut moments_vir: Vec<Array3<Complex64>> =
            vec![Array3::zeros((nmom + 1, nmo, nmo)); nk];

        for order in 0..=nmom {
            for pair in kpts.conserving_pairs() {
                let (q, kp, kx) = (pair.q, pair.k, pair.k_minus_q);
                for t in 0..=order {
                    let fp = binomial(order, t);
                    let fh = fp * if t % 2 == 0 { 1.0 } else { -1.0 };
                    for (x, (&e, &o)) in self.mo_energy_g[kx]
                        .iter()
                        .zip(self.mo_occ_g[kx].iter())
                        .enumerate()
                    {
                        let weight = e.powi((order - t) as i32);
                        let contrib = eta[kp][q]
                            .slice(s![x, t, .., ..])
                            .mapv(|v| v * weight);
                        if o > 0.0 {
                            moments_occ[kp]
                                .slice_mut(s![order, .., ..])
                                .add_assign(&contrib.mapv(|v| v * fh));
                        } else {
                            moments_vir[kp]
                                .slice_mut(s![order, .., ..])
                                .add_assign(&contrib.mapv(|v| v * fp));
                        }
                    }
                }
            }
        }

        for k in 0..nk {
            for order in 0..=nmom {
                enforce_hermiticity(&mut moments_occ[k], order, k, "occupied")?;
                enforce_hermiticity(&mut moments_vir[k], order, k, "virtual")?;
            }
        }

        Ok((moments_occ, moments_vir))
    }
}

/// The outer difference of virtual and occupied screened-interaction orbital
/// energies, flattened over the occupied x virtual index.
fn energy_differences(
    e_occ_point: &Array1<f64>,
    occ_occ_point: &Array1<f64>,
    e_vir_point: &Array1<f64>,
    occ_vir_point: &Array1<f64>,
) -> Array1<f64> {
    let e_i: Vec<f64> = e_occ_point
        .iter()
        .zip(occ_occ_point.iter())
        .filter(|(_, &o)| o > 0.0)
        .map(|(&e, _)| e)
        .collect();
    let e_a: Vec<f64> = e_vir_point
        .iter()
        .zip(occ_vir_point.iter())
        .filter(|(_, &o)| o == 0.0)
        .map(|(&e, _)| e)
        .collect();
    let mut d = Array1::zeros(e_i.len() * e_a.len());
    for (i, &ei) in e_i.iter().enumerate() {
        for (a, &ea) in e_a.iter().enumerate() {
            d[i * e_a.len() + a] = ea - ei;
        }
    }
    d
}

/// Binomial coefficient as a float.
fn binomial(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

/// Verifies the Hermiticity of one self-energy moment and symmetrises away
/// the floating-point asymmetry once the hard gate has passed.
fn enforce_hermiticity(
    moments: &mut Array3<Complex64>,
    order: usize,
    k: usize,
    sector: &str,
) -> Result<(), McGwError> {
    let m = moments.index_axis(Axis(0), order).to_owned();
    let m_h = m.t().mapv(|x| x.conj());
    let asym = (&m - &m_h).norm_l2();
    let scale = m.norm_l2().max(1.0);
    if asym > HERMITICITY_TOL * scale {
        return Err(McGwError::InvariantViolation(format!(
            "{sector} self-energy moment {order} at momentum point {k} is not Hermitian \
             (asymmetry {asym:.3e})"
        )));
    }
    let sym = (&m + &m_h).mapv(|x| 0.5 * x);
    moments.index_axis_mut(Axis(0), order).assign(&sym);
    Ok(())
}
