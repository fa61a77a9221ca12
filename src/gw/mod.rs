//! One-shot moment-constrained GW on a momentum mesh.
//!
//! [`Kgw`] performs a single pass of the moment pipeline: transform the
//! density-fitted integrals at the supplied orbitals, build the
//! density-density response moments by recursion, convolve them into
//! self-energy moments, fit the moments to self-energy poles, and solve the
//! Dyson equation through the supermatrix eigenproblem. The result is a
//! Green's function and self-energy in pole form at every momentum point,
//! plus quasiparticle energies read off by best-overlap pole matching.

use std::fmt;

use anyhow::{self, ensure};
use derive_builder::Builder;
use itertools::Itertools;
use ndarray::{Array1, Array2, Axis};
use num_complex::Complex64;

use crate::error::McGwError;
use crate::ints::{DensityFittingProvider, KIntegrals, KIntegralsParams};
use crate::io::format::{log_title, mcgw_output, mcgw_warn, nice_bool, McGwOutput};
use crate::kpts::KPointMesh;
use crate::parallel::CollectiveOps;
use crate::scf::KScfReference;
use crate::spectral::{binsearch_chempot, dyson_supermatrix, Lehmann};
use crate::tda::TdaSolver;


/// The polarizability entering the screened interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarizability {
    /// Density-density response in the Tamm–Dancoff approximation, built by
    /// moment recursion. The only supported kernel.
    Dtda,

    /// The same response obtained by exact diagonalisation. Unimplemented;
    /// requesting it fails before any work is performed.
    DtdaExact,
}

impl fmt::Display for Polarizability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dtda => write!(f, "dtda"),
            Self::DtdaExact => write!(f, "dtda-exact"),
        }
    }
}

/// Options controlling the one-shot solver.
#[derive(Clone, Builder, Debug)]
pub struct KgwParams {
    /// Diagonal approximation in the self-energy.
    #[builder(default = "false")]
    pub diagonal_se: bool,

    /// Polarizability kernel.
    #[builder(default = "Polarizability::Dtda")]
    pub polarizability: Polarizability,

    /// Options forwarded to the integral transform.
    #[builder(default = "KIntegralsParams::default()")]
    pub integrals: KIntegralsParams,
}

impl KgwParams {
    /// Returns a builder to construct a [`KgwParams`] structure.
    pub fn builder() -> KgwParamsBuilder {
        KgwParamsBuilder::default()
    }
}

impl Default for KgwParams {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Default solver parameters should build.")
    }
}

impl fmt::Display for KgwParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Diagonal self-energy: {}", nice_bool(self.diagonal_se))?;
        writeln!(f, "Polarizability: {}", self.polarizability)?;
        write!(f, "{}", self.integrals)?;
        Ok(())
    }
}

/// The outcome of one self-energy solve.
#[derive(Clone, Debug)]
pub struct SolveResult {
    /// Convergence flag; always `true` for a one-shot solver.
    pub converged: bool,

    /// Green's-function poles per momentum point.
    pub gf: Vec<Lehmann>,

    /// Self-energy poles per momentum point.
    pub se: Vec<Lehmann>,
}

/// A component able to produce a pole representation of the Green's function
/// and self-energy at given orbitals. The quasiparticle self-consistency
/// driver accepts any implementation.
pub trait SelfEnergySolver {
    /// Whether this solver would construct the response moments by exact
    /// diagonalisation, which the drivers must refuse.
    fn uses_exact_response(&self) -> bool {
        false
    }

    /// Solves for the self-energy at the supplied orbital energies and
    /// coefficients.
    fn solve<C: CollectiveOps>(
        &self,
        nmom_max: usize,
        mo_energy: &[Array1<f64>],
        mo_coeff: &[Array2<Complex64>],
        ops: &C,
    ) -> Result<SolveResult, anyhow::Error>;
}

/// The one-shot moment-constrained KGW solver.
pub struct Kgw<'a, P: DensityFittingProvider> {
    provider: &'a P,
    kpts: &'a KPointMesh,
    scf: &'a KScfReference,
    params: KgwParams,
}

impl<'a, P: DensityFittingProvider> Kgw<'a, P> {
    /// Constructs a solver over a density-fitting provider, a momentum mesh
    /// and a mean-field reference.
    pub fn new(
        provider: &'a P,
        kpts: &'a KPointMesh,
        scf: &'a KScfReference,
        params: KgwParams,
    ) -> Result<Self, anyhow::Error> {
        ensure!(
            scf.mo_energy().len() == kpts.len(),
            "Mean-field data must cover every momentum point."
        );
        Ok(Self {
            provider,
            kpts,
            scf,
            params,
        })
    }

    /// The solver options.
    pub fn params(&self) -> &KgwParams {
        &self.params
    }

    /// Runs the solver at the reference (or supplied) orbitals and reports
    /// the leading ionisation and attachment levels.
    ///
    /// Returns the convergence flag, the Green's function and self-energy
    /// poles per momentum point, and the quasiparticle energies.
    pub fn kernel<C: CollectiveOps>(
        &self,
        nmom_max: usize,
        mo_energy: Option<&[Array1<f64>]>,
        mo_coeff: Option<&[Array2<Complex64>]>,
        ops: &C,
    ) -> Result<(bool, Vec<Lehmann>, Vec<Lehmann>, Vec<Array1<f64>>), anyhow::Error> {
        log_title("Moment-Constrained KGW");
        self.params.log_output_display();
        mcgw_output!("nmom_max = {nmom_max}");

        let mo_energy = mo_energy.unwrap_or(self.scf.mo_energy());
        let mo_coeff = mo_coeff.unwrap_or(self.scf.mo_coeff());
        let result = self.solve(nmom_max, mo_energy, mo_coeff, ops)?;

        report_frontier_levels(&result.gf[0]);

        let qp_energy = gf_to_mo_energy(&result.gf, mo_energy);
        Ok((result.converged, result.gf, result.se, qp_energy))
    }
}

impl<'a, P: DensityFittingProvider> SelfEnergySolver for Kgw<'a, P> {
    fn uses_exact_response(&self) -> bool {
        self.params.polarizability == Polarizability::DtdaExact
    }

    fn solve<C: CollectiveOps>(
        &self,
        nmom_max: usize,
        mo_energy: &[Array1<f64>],
        mo_coeff: &[Array2<Complex64>],
        ops: &C,
    ) -> Result<SolveResult, anyhow::Error> {
        if self.uses_exact_response() {
            return Err(McGwError::unimplemented_exact_dd().into());
        }

        let nk = self.kpts.len();
        let mo_occ = self.scf.mo_occ().to_vec();

        // The tensor blocks are rebuilt from the current coefficients; they
        // stay read-only for the rest of this solve.
        let mut ints = KIntegrals::new(
            self.provider,
            self.kpts,
            mo_coeff.to_vec(),
            mo_occ.clone(),
            self.params.integrals.clone(),
        )?;
        ints.transform(None, true, true, ops)?;

        let mut tda = TdaSolver::new(&ints, nmom_max, mo_energy.to_vec(), mo_occ.clone())?;
        tda.set_diagonal_se(self.params.diagonal_se);
        let dd = tda.build_dd_moments(ops)?;
        let (th, tp) = tda.build_se_moments(&dd)?;

        // Static part of the self-energy: the Fock matrix at the current
        // density, in the current orbital basis.
        let dm: Vec<Array2<Complex64>> = mo_occ
            .iter()
            .map(|o| Array2::from_diag(&o.mapv(|x| Complex64::new(x, 0.0))))
            .collect();
        let h1e: Vec<Array2<Complex64>> = (0..nk)
            .map(|k| {
                let c = &mo_coeff[k];
                let c_h = c.t().mapv(|x| x.conj());
                c_h.dot(&self.scf.hcore()[k]).dot(c)
            })
            .collect();
        let fock = ints.get_fock(&dm, &h1e, ops)?;

        let nelec = self.scf.nelec();
        let mut gf = Vec::with_capacity(nk);
        let mut se = Vec::with_capacity(nk);
        for k in 0..nk {
            let chempot0 = frontier_midpoint(&mo_energy[k], &mo_occ[k]);
            let th_k = (0..=nmom_max)
                .map(|n| th[k].index_axis(Axis(0), n).to_owned())
                .collect_vec();
            let tp_k = (0..=nmom_max)
                .map(|n| tp[k].index_axis(Axis(0), n).to_owned())
                .collect_vec();
            let se_occ = Lehmann::from_moments(&th_k, chempot0)?;
            let se_vir = Lehmann::from_moments(&tp_k, chempot0)?;
            let mut se_k = se_occ.concat(&se_vir)?;

            let mut gf_k = dyson_supermatrix(&fock[k], &se_k)?;
            let (chempot, nerr) = binsearch_chempot(&gf_k, nelec[k]);
            if nerr > 1e-8 {
                log::debug!("Electron-count error {nerr:.3e} at momentum point {k}");
            }
            gf_k.set_chempot(chempot);
            se_k.set_chempot(chempot);

            gf.push(gf_k);
            se.push(se_k);
        }

        Ok(SolveResult {
            converged: true,
            gf,
            se,
        })
    }
}

/// The midpoint between the highest occupied and lowest unoccupied orbital
/// energy.
pub(crate) fn frontier_midpoint(mo_energy: &Array1<f64>, mo_occ: &Array1<f64>) -> f64 {
    let homo = mo_energy
        .iter()
        .zip(mo_occ.iter())
        .filter(|(_, &o)| o > 0.0)
        .map(|(&e, _)| e)
        .fold(f64::NEG_INFINITY, f64::max);
    let lumo = mo_energy
        .iter()
        .zip(mo_occ.iter())
        .filter(|(_, &o)| o == 0.0)
        .map(|(&e, _)| e)
        .fold(f64::INFINITY, f64::min);
    match (homo.is_finite(), lumo.is_finite()) {
        (true, true) => 0.5 * (homo + lumo),
        (true, false) => homo + 1.0,
        (false, true) => lumo - 1.0,
        (false, false) => 0.0,
    }
}

/// Finds, per momentum point, the pole of the Green's function with the
/// largest overlap on each orbital and returns its energy as the updated
/// quasiparticle energy. Warns when two orbitals pick the same pole.
pub(crate) fn gf_to_mo_energy(
    gf: &[Lehmann],
    mo_energy: &[Array1<f64>],
) -> Vec<Array1<f64>> {
    gf.iter()
        .zip(mo_energy.iter())
        .enumerate()
        .map(|(k, (g, e_ref))| {
            let mut chosen = std::collections::HashSet::new();
            let mut energies = Array1::zeros(e_ref.len());
            for i in 0..e_ref.len() {
                let arg = (0..g.npoles())
                    .max_by(|&a, &b| {
                        let wa = g.couplings()[(i, a)].norm_sqr();
                        let wb = g.couplings()[(i, b)].norm_sqr();
                        wa.partial_cmp(&wb).expect("Comparable pole weights.")
                    })
                    .expect("At least one pole.");
                energies[i] = g.energies()[arg];
                chosen.insert(arg);
            }
            if chosen.len() != e_ref.len() {
                mcgw_warn!("Inconsistent quasiparticle weights at momentum point {k}!");
            }
            energies
        })
        .collect()
}

/// Logs the leading ionisation and attachment levels of a Green's function
/// with their quasiparticle weights.
pub(crate) fn report_frontier_levels(gf: &Lehmann) {
    let gf_occ = gf.get_occupied().remove_uncoupled(1e-1);
    for n in 0..gf_occ.npoles().min(5) {
        let idx = gf_occ.npoles() - 1 - n;
        let en = -gf_occ.energies()[idx];
        let qpwt = gf_occ.weights()[idx];
        mcgw_output!("IP energy level (Γ) {n} E = {en:.16}  QP weight = {qpwt:.6}");
    }

    let gf_vir = gf.get_virtual().remove_uncoupled(1e-1);
    for n in 0..gf_vir.npoles().min(5) {
        let en = gf_vir.energies()[n];
        let qpwt = gf_vir.weights()[n];
        mcgw_output!("EA energy level (Γ) {n} E = {en:.16}  QP weight = {qpwt:.6}");
    }
}
