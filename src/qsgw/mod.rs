//! Quasiparticle self-consistent GW via self-energy moment constraints.
//!
//! The driver iterates three nested fixed points:
//!
//! 1. an outer loop that re-solves the moment-constrained self-energy at the
//!    current orbitals,
//! 2. a static-potential projection folding the self-energy poles into a
//!    single energy-independent Hermitian matrix, accelerated by DIIS, and
//! 3. an inner Fock loop that rediagonalises the Fock matrix plus static
//!    potential until the density matrix stops changing.
//!
//! Convergence combines three independently thresholded signals (orbital
//! energies, hole/particle moments, inner density) through a configurable
//! logical combinator. Non-convergence of the inner loop is reported, not
//! fatal; exhaustion of the outer iteration budget returns a `false` flag
//! rather than an error.

use std::fmt;

use anyhow::{self, ensure};
use derive_builder::Builder;
use itertools::Itertools;
use ndarray::{Array1, Array2, Array3, Axis};
use ndarray_linalg::{Eigh, UPLO};
use num_complex::Complex64;

use crate::diis::Diis;
use crate::error::McGwError;
use crate::gw::{gf_to_mo_energy, report_frontier_levels, SelfEnergySolver};
use crate::ints::{DensityFittingProvider, KIntegrals, KIntegralsParams};
use crate::io::format::{log_subtitle, log_title, mcgw_output, nice_bool, write_subtitle, McGwOutput};
use crate::kpts::KPointMesh;
use crate::parallel::{broadcast, broadcast_real, CollectiveOps};
use crate::scf::{density_from_orbitals, KScfReference};
use crate::spectral::Lehmann;

#[cfg(test)]
#[path = "qsgw_tests.rs"]
mod qsgw_tests;

/// Logical combination of the three convergence signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvLogical {
    /// Every signal must be satisfied.
    All,

    /// Any single satisfied signal suffices.
    Any,
}

impl fmt::Display for ConvLogical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Any => write!(f, "any"),
        }
    }
}

/// Options controlling the quasiparticle self-consistency.
#[derive(Clone, Builder, Debug)]
pub struct QsKgwParams {
    /// Maximum number of outer iterations.
    #[builder(default = "50")]
    pub max_cycle: usize,

    /// Maximum number of iterations in the inner Fock loop.
    #[builder(default = "50")]
    pub max_cycle_qp: usize,

    /// Convergence threshold on the change in the orbital energies.
    #[builder(default = "1e-8")]
    pub conv_tol: f64,

    /// Convergence threshold on the change in the hole and particle
    /// self-energy moments.
    #[builder(default = "1e-6")]
    pub conv_tol_moms: f64,

    /// Convergence threshold on the change in the density matrix within the
    /// inner Fock loop.
    #[builder(default = "1e-8")]
    pub conv_tol_qp: f64,

    /// Combination of the three convergence signals.
    #[builder(default = "ConvLogical::All")]
    pub conv_logical: ConvLogical,

    /// Size of the DIIS space of the outer static-potential loop.
    #[builder(default = "8")]
    pub diis_space: usize,

    /// Size of the DIIS space of the inner Fock loop.
    #[builder(default = "8")]
    pub diis_space_qp: usize,

    /// Imaginary broadening regularising the static potential, signed by
    /// the pole position.
    #[builder(default = "0.1")]
    pub eta: f64,

    /// Similarity-renormalisation-group flow parameter. When non-zero it
    /// replaces the `eta` broadening with a decaying-exponential
    /// regularisation free of the sign-dependent broadening artifact.
    #[builder(default = "0.0")]
    pub srg: f64,

    /// Options for the integrals used by the inner Fock builds.
    #[builder(default = "KIntegralsParams::default()")]
    pub integrals: KIntegralsParams,
}

impl QsKgwParams {
    /// Returns a builder to construct a [`QsKgwParams`] structure.
    pub fn builder() -> QsKgwParamsBuilder {
        QsKgwParamsBuilder::default()
    }
}

impl Default for QsKgwParams {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Default driver parameters should build.")
    }
}

impl fmt::Display for QsKgwParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_subtitle(f, "qsKGW options")?;
        writeln!(f, "Max cycles: {}", self.max_cycle)?;
        writeln!(f, "Max QP cycles: {}", self.max_cycle_qp)?;
        writeln!(f, "Energy tolerance: {:.3e}", self.conv_tol)?;
        writeln!(f, "Moment tolerance: {:.3e}", self.conv_tol_moms)?;
        writeln!(f, "Density tolerance: {:.3e}", self.conv_tol_qp)?;
        writeln!(f, "Convergence logic: {}", self.conv_logical)?;
        writeln!(f, "DIIS space: {}", self.diis_space)?;
        writeln!(f, "QP DIIS space: {}", self.diis_space_qp)?;
        writeln!(f, "Broadening eta: {:.3e}", self.eta)?;
        writeln!(
            f,
            "SRG regularisation: {}",
            if self.srg == 0.0 {
                nice_bool(false)
            } else {
                format!("{:.3e}", self.srg)
            }
        )?;
        Ok(())
    }
}

/// The outcome of a quasiparticle self-consistency run.
#[derive(Clone, Debug)]
pub struct QsKgwResult {
    /// Whether all requested convergence signals were met within the
    /// iteration budget.
    pub converged: bool,

    /// Green's-function poles per momentum point at the final orbitals.
    pub gf: Vec<Lehmann>,

    /// Self-energy poles per momentum point at the final orbitals.
    pub se: Vec<Lehmann>,

    /// Quasiparticle orbital energies per momentum point.
    pub qp_energy: Vec<Array1<f64>>,
}

/// The quasiparticle self-consistent KGW driver.
///
/// Accepts any inner solver satisfying the [`SelfEnergySolver`] contract.
pub struct QsKgw<'a, P: DensityFittingProvider, S: SelfEnergySolver> {
    provider: &'a P,
    kpts: &'a KPointMesh,
    scf: &'a KScfReference,
    solver: &'a S,
    params: QsKgwParams,
}

impl<'a, P: DensityFittingProvider, S: SelfEnergySolver> QsKgw<'a, P, S> {
    /// Constructs a driver over a density-fitting provider, momentum mesh,
    /// mean-field reference and inner self-energy solver.
    pub fn new(
        provider: &'a P,
        kpts: &'a KPointMesh,
        scf: &'a KScfReference,
        solver: &'a S,
        params: QsKgwParams,
    ) -> Result<Self, anyhow::Error> {
        ensure!(
            scf.mo_energy().len() == kpts.len(),
            "Mean-field data must cover every momentum point."
        );
        Ok(Self {
            provider,
            kpts,
            scf,
            solver,
            params,
        })
    }

    /// The driver options.
    pub fn params(&self) -> &QsKgwParams {
        &self.params
    }

    /// Runs the quasiparticle self-consistency to the configured tolerances.
    ///
    /// The convergence predicate ([`Self::check_convergence`]) may be
    /// re-evaluated by callers with their own thresholds; the returned flag
    /// reflects the configured combinator.
    pub fn kernel<C: CollectiveOps>(
        &self,
        nmom_max: usize,
        ops: &C,
    ) -> Result<QsKgwResult, anyhow::Error> {
        log_title("Quasiparticle Self-Consistent KGW");
        self.params.log_output_display();
        mcgw_output!("nmom_max = {nmom_max}");

        // The exact-diagonalisation response variant is unsupported here;
        // refuse before any work is done.
        if self.solver.uses_exact_response() {
            return Err(McGwError::unimplemented_exact_dd().into());
        }

        let nk = self.kpts.len();
        let mo_occ = self.scf.mo_occ().to_vec();
        let mo_coeff_ref = self.scf.mo_coeff().to_vec();
        let mut mo_energy = self.scf.mo_energy().to_vec();
        let mut mo_coeff = mo_coeff_ref.clone();

        // Reference-orbital quantities for the inner Fock builds.
        let ovlp = self.scf.ovlp().to_vec();
        let h1e: Vec<Array2<Complex64>> = (0..nk)
            .map(|k| {
                let c = &mo_coeff_ref[k];
                let c_h = c.t().mapv(|x| x.conj());
                c_h.dot(&self.scf.hcore()[k]).dot(c)
            })
            .collect();
        let mut dm: Vec<Array2<Complex64>> = {
            let dm_ao = self.scf.make_rdm1();
            (0..nk)
                .map(|k| {
                    let sc = ovlp[k].dot(&mo_coeff_ref[k]);
                    let sc_h = sc.t().mapv(|x| x.conj());
                    sc_h.dot(&dm_ao[k]).dot(&sc)
                })
                .collect()
        };

        let mut ints = KIntegrals::new(
            self.provider,
            self.kpts,
            mo_coeff_ref.clone(),
            mo_occ.clone(),
            self.params.integrals.clone(),
        )?;
        ints.transform(None, false, false, ops)?;

        let mut diis = Diis::new(self.params.diis_space);

        // Initial self-energy at the reference orbitals.
        let mut result = self.solver.solve(nmom_max, &mo_energy, &mo_coeff, ops)?;
        let (mut th, mut tp) = self_energy_to_moments(&result.se, nmom_max);

        log_subtitle("Iterative quasiparticle self-consistency");

        let mut converged = false;
        let mut dm_error = f64::INFINITY;
        for cycle in 1..=self.params.max_cycle {
            mcgw_output!("qsKGW iteration {cycle}");

            // Fold the self-energy poles into the static potential, project
            // it into the reference orbital basis, and accelerate it.
            let mut se_qp = Array3::<Complex64>::zeros((nk, self.nmo(), self.nmo()));
            for k in 0..nk {
                let folded = self.build_static_potential(&mo_energy[k], &result.se[k]);
                let projected =
                    project_matrix(&folded, &ovlp[k], &mo_coeff[k], &mo_coeff_ref[k]);
                se_qp.index_axis_mut(Axis(0), k).assign(&projected);
            }
            let se_qp = diis.update(se_qp);

            // Inner Fock loop on the folded static self-energy.
            let mut diis_qp = Diis::new(self.params.diis_space_qp);
            let mut conv_qp = false;
            let mo_energy_prev = mo_energy.clone();
            for _ in 1..=self.params.max_cycle_qp {
                let fock = ints.get_fock(&dm, &h1e, ops)?;
                let mut fock_eff = Array3::<Complex64>::zeros(se_qp.dim());
                for k in 0..nk {
                    let f = &fock[k] + &se_qp.index_axis(Axis(0), k);
                    fock_eff.index_axis_mut(Axis(0), k).assign(&f);
                }
                let mut fock_eff = diis_qp.update(fock_eff);
                broadcast(ops, &mut fock_eff, 0);

                let mut u = Vec::with_capacity(nk);
                for k in 0..nk {
                    let (e_k, mut u_k) =
                        fock_eff.index_axis(Axis(0), k).to_owned().eigh(UPLO::Lower)?;
                    let mut e_k = e_k;
                    // All workers keep bit-identical orbitals.
                    broadcast_real(ops, &mut e_k, 0);
                    broadcast(ops, &mut u_k, 0);
                    mo_energy[k] = e_k;
                    mo_coeff[k] = mo_coeff_ref[k].dot(&u_k);
                    u.push(u_k);
                }

                let dm_prev = dm.clone();
                dm = density_from_orbitals(&u, &mo_occ);
                dm_error = dm
                    .iter()
                    .zip(dm_prev.iter())
                    .map(|(a, b)| {
                        (a - b)
                            .iter()
                            .map(|x| x.norm())
                            .fold(0.0, f64::max)
                    })
                    .fold(0.0, f64::max);
                if dm_error < self.params.conv_tol_qp {
                    conv_qp = true;
                    break;
                }
            }
            if conv_qp {
                mcgw_output!("QP loop converged.");
            } else {
                mcgw_output!("QP loop failed to converge.");
            }

            // Re-solve the self-energy at the updated orbitals.
            result = self.solver.solve(nmom_max, &mo_energy, &mo_coeff, ops)?;
            let (th_new, tp_new) = self_energy_to_moments(&result.se, nmom_max);
            let th_prev = std::mem::replace(
                &mut th,
                project_moments(&th_new, &ovlp, &mo_coeff, &mo_coeff_ref),
            );
            let tp_prev = std::mem::replace(
                &mut tp,
                project_moments(&tp_new, &ovlp, &mo_coeff, &mo_coeff_ref),
            );

            converged = self.check_convergence(
                &mo_energy,
                &mo_energy_prev,
                &th,
                &th_prev,
                &tp,
                &tp_prev,
                dm_error,
            );
            if converged {
                break;
            }
        }

        if converged {
            mcgw_output!("qsKGW converged");
        } else {
            mcgw_output!("qsKGW failed to converge");
        }
        report_frontier_levels(&result.gf[0]);

        let qp_energy = gf_to_mo_energy(&result.gf, &mo_energy);
        Ok(QsKgwResult {
            converged,
            gf: result.gf,
            se: result.se,
            qp_energy,
        })
    }

    /// Folds the self-energy poles into a static, energy-independent
    /// potential.
    ///
    /// The default regularisation broadens each pole by `eta`, signed by the
    /// pole position; with a non-zero `srg` flow parameter the
    /// similarity-renormalisation-group damping of Marie and Loos replaces
    /// the broadening. The result is the Hermitian part of the folded
    /// matrix.
    pub fn build_static_potential(
        &self,
        mo_energy: &Array1<f64>,
        se: &Lehmann,
    ) -> Array2<Complex64> {
        let nmo = mo_energy.len();
        let couplings = se.couplings();
        let energies = se.energies();
        let mut folded = Array2::<Complex64>::zeros((nmo, nmo));

        if self.params.srg == 0.0 {
            for p in 0..nmo {
                for q in 0..nmo {
                    let mut acc = Complex64::new(0.0, 0.0);
                    for (x, &e_x) in energies.iter().enumerate() {
                        let denom =
                            Complex64::new(mo_energy[p] - e_x, -e_x.signum() * self.params.eta);
                        acc += couplings[(p, x)] * couplings[(q, x)].conj() / denom;
                    }
                    folded[(p, q)] = acc;
                }
            }
        } else {
            for p in 0..nmo {
                for q in 0..nmo {
                    let mut acc = Complex64::new(0.0, 0.0);
                    for (x, &e_x) in energies.iter().enumerate() {
                        let dp = mo_energy[p] - e_x;
                        let dq = mo_energy[q] - e_x;
                        let d2 = dp * dp + dq * dq;
                        if d2 < f64::EPSILON {
                            continue;
                        }
                        let reg = (1.0 - (-d2 * self.params.srg).exp()) * (dp + dq) / d2;
                        acc += couplings[(p, x)] * couplings[(q, x)].conj() * reg;
                    }
                    folded[(p, q)] = acc;
                }
            }
        }

        let folded_h = folded.t().mapv(|x| x.conj());
        (&folded + &folded_h).mapv(|x| 0.5 * x)
    }

    /// Combines the three convergence signals through the configured
    /// combinator.
    #[allow(clippy::too_many_arguments)]
    pub fn check_convergence(
        &self,
        mo_energy: &[Array1<f64>],
        mo_energy_prev: &[Array1<f64>],
        th: &[Array3<Complex64>],
        th_prev: &[Array3<Complex64>],
        tp: &[Array3<Complex64>],
        tp_prev: &[Array3<Complex64>],
        dm_error: f64,
    ) -> bool {
        let error_energy = mo_energy
            .iter()
            .zip(mo_energy_prev.iter())
            .map(|(a, b)| (a - b).iter().fold(0.0f64, |m, x| m.max(x.abs())))
            .fold(0.0, f64::max);
        let error_moments = th
            .iter()
            .zip(th_prev.iter())
            .chain(tp.iter().zip(tp_prev.iter()))
            .map(|(a, b)| (a - b).iter().map(|x| x.norm()).fold(0.0, f64::max))
            .fold(0.0, f64::max);

        log::debug!(
            "Convergence deltas: energy {error_energy:.3e}, moments {error_moments:.3e}, \
             density {dm_error:.3e}"
        );

        let signals = [
            error_energy < self.params.conv_tol,
            error_moments < self.params.conv_tol_moms,
            dm_error < self.params.conv_tol_qp,
        ];
        match self.params.conv_logical {
            ConvLogical::All => signals.iter().all(|&s| s),
            ConvLogical::Any => signals.iter().any(|&s| s),
        }
    }

    fn nmo(&self) -> usize {
        self.scf.mo_coeff()[0].ncols()
    }
}

/// Projects a matrix from the basis of `mo_from` into the basis of `mo_to`
/// through the shared-basis overlap sandwich.
fn project_matrix(
    matrix: &Array2<Complex64>,
    ovlp: &Array2<Complex64>,
    mo_from: &Array2<Complex64>,
    mo_to: &Array2<Complex64>,
) -> Array2<Complex64> {
    let proj = mo_from.t().mapv(|x| x.conj()).dot(ovlp).dot(mo_to);
    let proj_h = proj.t().mapv(|x| x.conj());
    proj_h.dot(matrix).dot(&proj)
}

/// Projects per-k moment stacks into the reference orbital basis.
fn project_moments(
    moments: &[Array3<Complex64>],
    ovlp: &[Array2<Complex64>],
    mo_from: &[Array2<Complex64>],
    mo_to: &[Array2<Complex64>],
) -> Vec<Array3<Complex64>> {
    moments
        .iter()
        .enumerate()
        .map(|(k, stack)| {
            let mut out = Array3::zeros(stack.dim());
            for (n, m) in stack.outer_iter().enumerate() {
                let projected =
                    project_matrix(&m.to_owned(), &ovlp[k], &mo_from[k], &mo_to[k]);
                out.index_axis_mut(Axis(0), n).assign(&projected);
            }
            out
        })
        .collect()
}

/// Extracts the hole and particle moment stacks of a self-energy per
/// momentum point.
pub fn self_energy_to_moments(
    se: &[Lehmann],
    nmom_max: usize,
) -> (Vec<Array3<Complex64>>, Vec<Array3<Complex64>>) {
    let stack = |poles: &Lehmann| {
        let nmo = poles.nphys();
        let mut out = Array3::zeros((nmom_max + 1, nmo, nmo));
        for (n, m) in poles.moments(nmom_max).into_iter().enumerate() {
            out.index_axis_mut(Axis(0), n).assign(&m);
        }
        out
    };
    let th = se.iter().map(|s| stack(&s.get_occupied())).collect_vec();
    let tp = se.iter().map(|s| stack(&s.get_virtual())).collect_vec();
    (th, tp)
}
