//! Density-fitted integral containers over a momentum mesh.
//!
//! [`KIntegrals`] owns the three-index tensor families consumed by the
//! moment recursion, keyed by ordered momentum-point pairs:
//!
//! - `Lpq`: the full, uncompressed `(aux, MO, MO)` tensor, retained only when
//!   requested,
//! - `Lpx`: the compressed `(aux, MO, G-orbital)` tensor,
//! - `Lia`: the compressed `(aux, occ × vir)` tensor of the screened
//!   interaction basis,
//! - `Lai`: the conjugate partner of `Lia` built from the inverted momentum
//!   transfer.
//!
//! The auxiliary index may be truncated per momentum transfer by a
//! data-dependent compression basis obtained from the eigendecomposition of a
//! q-resolved Gram metric. Raw blocks are streamed from a
//! [`DensityFittingProvider`] in chunks, so the full auxiliary dimension
//! never needs to be held as a single array.

use std::fmt;
use std::ops::AddAssign;

use anyhow::{self, ensure};
use derive_builder::Builder;
use indexmap::IndexMap;
use itertools::Itertools;
use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use ndarray_einsum_beta::einsum;
use ndarray_linalg::{Eigh, UPLO};
use num_complex::Complex64;

use crate::error::McGwError;
use crate::io::format::{mcgw_output, nice_bool};
use crate::kpts::KPointMesh;
use crate::parallel::{allreduce_sum, broadcast, CollectiveOps};


/// Auxiliary chunk length used by the stored-tensor exchange build.
const AUX_BLKSIZE: usize = 240;

// =========================
// Density-fitting providers
// =========================

/// A chunk of a raw density-fitted block streamed by a provider.
///
/// Real and imaginary parts are carried separately, following the layout in
/// which periodic density-fitting intermediates are stored on disk. A
/// `dimension` of `-1` is the sentinel for a low-dimensional
/// (non-3D-periodic) block, which the transform machinery cannot handle.
#[derive(Clone, Debug)]
pub struct DfChunk {
    /// Real part, shape `(naux_chunk, nao, nao)`.
    pub real: Array3<f64>,

    /// Imaginary part, shape `(naux_chunk, nao, nao)`.
    pub imag: Array3<f64>,

    /// Periodic dimensionality sentinel; `-1` flags an unsupported block.
    pub dimension: i32,
}

impl DfChunk {
    /// Assembles the complex block from the real and imaginary parts.
    pub fn to_complex(&self) -> Array3<Complex64> {
        let mut block = self.real.mapv(|re| Complex64::new(re, 0.0));
        block.zip_mut_with(&self.imag, |b, &im| b.im = im);
        block
    }

    /// Number of auxiliary rows in this chunk.
    pub fn naux(&self) -> usize {
        self.real.len_of(Axis(0))
    }
}

/// A streaming accessor for raw density-fitted three-index blocks.
///
/// For every ordered momentum-point pair the provider yields the
/// `(aux, AO, AO)` block in successive auxiliary chunks. Implementations
/// back onto disk-resident periodic density-fitting intermediates in
/// production; [`TensorProvider`] keeps everything in memory for molecular
/// work and tests.
pub trait DensityFittingProvider {
    /// Number of atomic-orbital basis functions.
    fn nao(&self) -> usize;

    /// Full (untruncated) auxiliary dimension.
    fn naux_full(&self) -> usize;

    /// Streams the raw block for the ordered momentum-point pair `pair`.
    fn sr_loop(&self, pair: (usize, usize)) -> Box<dyn Iterator<Item = DfChunk> + '_>;
}

/// An in-memory density-fitting provider holding one complex block per
/// ordered momentum-point pair.
#[derive(Clone, Debug)]
pub struct TensorProvider {
    blocks: IndexMap<(usize, usize), Array3<Complex64>>,
    nao: usize,
    naux: usize,
    chunk_size: usize,
    low_dimensional: bool,
}

impl TensorProvider {
    /// Wraps pair-keyed `(aux, AO, AO)` blocks into a provider streaming
    /// chunks of at most `chunk_size` auxiliary rows.
    pub fn new(
        blocks: IndexMap<(usize, usize), Array3<Complex64>>,
        chunk_size: usize,
    ) -> Result<Self, anyhow::Error> {
        ensure!(!blocks.is_empty(), "No density-fitted blocks supplied.");
        ensure!(chunk_size > 0, "Chunk size must be positive.");
        let shape = blocks[0].dim();
        ensure!(
            blocks.values().all(|b| b.dim() == shape),
            "Inconsistent density-fitted block shapes."
        );
        ensure!(
            shape.1 == shape.2,
            "Density-fitted blocks must be square over the orbital indices."
        );
        Ok(Self {
            blocks,
            nao: shape.1,
            naux: shape.0,
            chunk_size,
            low_dimensional: false,
        })
    }

    /// Marks every streamed chunk with the low-dimensional sentinel. Only
    /// useful to exercise the unsupported-integral failure path.
    pub fn flag_low_dimensional(mut self) -> Self {
        self.low_dimensional = true;
        self
    }
}

impl DensityFittingProvider for TensorProvider {
    fn nao(&self) -> usize {
        self.nao
    }

    fn naux_full(&self) -> usize {
        self.naux
    }

    fn sr_loop(&self, pair: (usize, usize)) -> Box<dyn Iterator<Item = DfChunk> + '_> {
        let block = self
            .blocks
            .get(&pair)
            .unwrap_or_else(|| panic!("No density-fitted block for pair {pair:?}."));
        let dimension = if self.low_dimensional { -1 } else { 3 };
        let chunk_size = self.chunk_size;
        let naux = self.naux;
        let iter = (0..naux).step_by(chunk_size).map(move |b0| {
            let b1 = naux.min(b0 + chunk_size);
            let chunk = block.slice(s![b0..b1, .., ..]);
            DfChunk {
                real: chunk.mapv(|x| x.re),
                imag: chunk.mapv(|x| x.im),
                dimension,
            }
        });
        Box::new(iter)
    }
}

// =================
// Compression basis
// =================

/// The auxiliary-index truncation at one momentum transfer.
///
/// The rotation is data-dependent: the retained rank follows from the
/// eigenvalue spectrum of the compression metric rather than from a fixed
/// target, so a transfer at which no truncation was found carries no
/// rotation at all instead of a sentinel identity matrix.
#[derive(Clone, Debug)]
pub enum AuxRotation {
    /// No truncation found; the full auxiliary dimension is kept.
    None,

    /// Rotation from the full auxiliary index into the retained subspace,
    /// shape `(naux_full, naux_compressed)`.
    Rotation(Array2<Complex64>),
}

impl AuxRotation {
    /// The effective auxiliary dimension under this rotation.
    pub fn rank(&self, naux_full: usize) -> usize {
        match self {
            Self::None => naux_full,
            Self::Rotation(r) => r.ncols(),
        }
    }
}

/// Per-momentum-transfer auxiliary truncations, indexed by `q`.
pub type CompressionBasis = Vec<AuxRotation>;

/// Orbital-block combinations accumulated into the compression metric.
///
/// Lowercase pairs follow the conventional labelling: `o`/`v` are the
/// occupied/virtual blocks of the bare orbital basis, `i`/`a` those of the
/// basis defining the screened interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompressionBlock {
    /// Bare occupied × bare occupied.
    Oo,

    /// Bare occupied × bare virtual.
    Ov,

    /// Bare virtual × bare virtual.
    Vv,

    /// Screened-interaction occupied × virtual.
    Ia,
}

impl fmt::Display for CompressionBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oo => write!(f, "oo"),
            Self::Ov => write!(f, "ov"),
            Self::Vv => write!(f, "vv"),
            Self::Ia => write!(f, "ia"),
        }
    }
}

/// Options controlling the integral transform.
#[derive(Clone, Builder, Debug)]
pub struct KIntegralsParams {
    /// Orbital blocks accumulated into the compression metric. An empty list
    /// disables compression entirely.
    #[builder(default = "vec![CompressionBlock::Ia]")]
    pub compression: Vec<CompressionBlock>,

    /// Eigenvalue-magnitude threshold below which auxiliary directions are
    /// discarded.
    #[builder(default = "1e-10")]
    pub compression_tol: f64,

    /// Whether to retain the full uncompressed `Lpq` tensor. Enables the
    /// fast Coulomb/exchange paths at a memory cost quadratic in the orbital
    /// count per pair.
    #[builder(default = "false")]
    pub store_full: bool,

    /// Lattice Madelung constant for the probe-charge correction to the
    /// exchange matrix at zero momentum transfer. A value of zero disables
    /// the correction.
    #[builder(default = "0.0")]
    pub madelung: f64,
}

impl KIntegralsParams {
    /// Returns a builder to construct a [`KIntegralsParams`] structure.
    pub fn builder() -> KIntegralsParamsBuilder {
        KIntegralsParamsBuilder::default()
    }
}

impl Default for KIntegralsParams {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Default integral parameters should build.")
    }
}

impl fmt::Display for KIntegralsParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Compression blocks: {}",
            self.compression.iter().map(|b| b.to_string()).join(",")
        )?;
        writeln!(f, "Compression tolerance: {:.3e}", self.compression_tol)?;
        writeln!(f, "Store full tensor: {}", nice_bool(self.store_full))?;
        writeln!(f, "Madelung constant: {:.6}", self.madelung)?;
        Ok(())
    }
}

// ==========
// KIntegrals
// ==========

type PairMap2 = IndexMap<(usize, usize), Array2<Complex64>>;
type PairMap3 = IndexMap<(usize, usize), Array3<Complex64>>;

/// Container for the density-fitted integrals required by the
/// moment-constrained GW methods on a momentum mesh.
///
/// The tensor families are rebuilt once per self-consistency cycle from the
/// current orbital coefficients and treated as read-only for the remainder
/// of that cycle.
pub struct KIntegrals<'a, P: DensityFittingProvider> {
    provider: &'a P,
    kpts: &'a KPointMesh,
    mo_coeff: Vec<Array2<Complex64>>,
    mo_occ: Vec<Array1<f64>>,
    mo_coeff_g: Option<Vec<Array2<Complex64>>>,
    mo_occ_g: Option<Vec<Array1<f64>>>,
    mo_coeff_w: Option<Vec<Array2<Complex64>>>,
    mo_occ_w: Option<Vec<Array1<f64>>>,
    params: KIntegralsParams,
    rot: Option<CompressionBasis>,
    lpq: PairMap3,
    lpx: PairMap3,
    lia: PairMap2,
    lai: PairMap2,
}

impl<'a, P: DensityFittingProvider> KIntegrals<'a, P> {
    /// Constructs an integral container for the given mesh and orbital data.
    ///
    /// `mo_coeff[k]` holds the orbital coefficients at momentum point `k` as
    /// an `(nao, nmo)` matrix; `mo_occ[k]` the corresponding occupation
    /// numbers. The bases defining the Green's function and the screened
    /// interaction default to the bare basis and can be narrowed with
    /// [`Self::set_g_basis`] and [`Self::set_w_basis`].
    pub fn new(
        provider: &'a P,
        kpts: &'a KPointMesh,
        mo_coeff: Vec<Array2<Complex64>>,
        mo_occ: Vec<Array1<f64>>,
        params: KIntegralsParams,
    ) -> Result<Self, anyhow::Error> {
        ensure!(!kpts.is_empty(), "Empty momentum mesh.");
        ensure!(
            mo_coeff.len() == kpts.len() && mo_occ.len() == kpts.len(),
            "Orbital data must cover every momentum point."
        );
        ensure!(
            mo_coeff.iter().all(|c| c.nrows() == provider.nao()),
            "Orbital coefficient rows must match the provider's AO count."
        );
        let nmo = mo_coeff[0].ncols();
        ensure!(
            mo_coeff.iter().all(|c| c.ncols() == nmo)
                && mo_occ.iter().all(|o| o.len() == nmo),
            "All momentum points must share the orbital count."
        );
        Ok(Self {
            provider,
            kpts,
            mo_coeff,
            mo_occ,
            mo_coeff_g: None,
            mo_occ_g: None,
            mo_coeff_w: None,
            mo_occ_w: None,
            params,
            rot: None,
            lpq: PairMap3::default(),
            lpx: PairMap3::default(),
            lia: PairMap2::default(),
            lai: PairMap2::default(),
        })
    }

    /// Narrows the basis defining the Green's function, *e.g.* for a
    /// frozen-core treatment.
    pub fn set_g_basis(&mut self, mo_coeff: Vec<Array2<Complex64>>, mo_occ: Vec<Array1<f64>>) {
        self.mo_coeff_g = Some(mo_coeff);
        self.mo_occ_g = Some(mo_occ);
    }

    /// Narrows the basis defining the screened interaction.
    pub fn set_w_basis(&mut self, mo_coeff: Vec<Array2<Complex64>>, mo_occ: Vec<Array1<f64>>) {
        self.mo_coeff_w = Some(mo_coeff);
        self.mo_occ_w = Some(mo_occ);
    }

    fn mo_coeff_g(&self) -> &[Array2<Complex64>] {
        self.mo_coeff_g.as_deref().unwrap_or(&self.mo_coeff)
    }

    fn mo_occ_g(&self) -> &[Array1<f64>] {
        self.mo_occ_g.as_deref().unwrap_or(&self.mo_occ)
    }

    fn mo_coeff_w(&self) -> &[Array2<Complex64>] {
        self.mo_coeff_w.as_deref().unwrap_or(&self.mo_coeff)
    }

    fn mo_occ_w(&self) -> &[Array1<f64>] {
        self.mo_occ_w.as_deref().unwrap_or(&self.mo_occ)
    }

    // ----------
    // Dimensions
    // ----------

    /// Number of orbitals in the bare basis.
    pub fn nmo(&self) -> usize {
        self.mo_coeff[0].ncols()
    }

    /// Number of occupied orbitals per momentum point.
    pub fn nocc(&self) -> Vec<usize> {
        self.mo_occ.iter().map(|o| count_occ(o)).collect()
    }

    /// Number of virtual orbitals per momentum point.
    pub fn nvir(&self) -> Vec<usize> {
        self.mo_occ.iter().map(|o| o.len() - count_occ(o)).collect()
    }

    /// Number of Green's-function orbitals per momentum point.
    pub fn nmo_g(&self) -> Vec<usize> {
        self.mo_coeff_g().iter().map(|c| c.ncols()).collect()
    }

    /// Number of occupied screened-interaction orbitals per momentum point.
    pub fn nocc_w(&self) -> Vec<usize> {
        self.mo_occ_w().iter().map(|o| count_occ(o)).collect()
    }

    /// Number of virtual screened-interaction orbitals per momentum point.
    pub fn nvir_w(&self) -> Vec<usize> {
        self.mo_occ_w()
            .iter()
            .map(|o| o.len() - count_occ(o))
            .collect()
    }

    /// Full auxiliary dimension of the provider.
    pub fn naux_full(&self) -> usize {
        self.provider.naux_full()
    }

    /// Post-compression auxiliary dimension per momentum transfer. Equal to
    /// the full dimension at transfers that were not compressed.
    pub fn naux(&self) -> Vec<usize> {
        let naux_full = self.naux_full();
        match &self.rot {
            None => vec![naux_full; self.kpts.len()],
            Some(rot) => rot.iter().map(|r| r.rank(naux_full)).collect(),
        }
    }

    /// The momentum mesh this container is defined over.
    pub fn kpts(&self) -> &KPointMesh {
        self.kpts
    }

    /// The transform options.
    pub fn params(&self) -> &KIntegralsParams {
        &self.params
    }

    /// The full `(aux, MO, MO)` tensors, if retained.
    pub fn lpq(&self) -> &PairMap3 {
        &self.lpq
    }

    /// The compressed `(aux, MO, G-orbital)` tensors.
    pub fn lpx(&self) -> &PairMap3 {
        &self.lpx
    }

    /// The compressed `(aux, occ × vir)` tensors.
    pub fn lia(&self) -> &PairMap2 {
        &self.lia
    }

    /// The compressed `(aux, occ × vir)` conjugate-partner tensors built
    /// from the inverted momentum transfer.
    pub fn lai(&self) -> &PairMap2 {
        &self.lai
    }

    // ------------------
    // Compression engine
    // ------------------

    /// Computes the per-momentum-transfer compression basis.
    ///
    /// For every requested orbital-block combination and every momentum
    /// transfer `q`, the Gram matrix of partially transformed auxiliary
    /// blocks is accumulated over the constituent momentum points and
    /// normalised by the mesh size. Each accumulated Hermitian metric is
    /// eigendecomposed on the designated worker only, eigenvectors with
    /// `|eigenvalue| > compression_tol` are retained, and the result is
    /// broadcast so every worker truncates identically. Transfers at which
    /// the retained rank equals the full dimension collapse to
    /// [`AuxRotation::None`].
    pub fn compute_compression_basis<C: CollectiveOps>(
        &self,
        ops: &C,
    ) -> Result<CompressionBasis, anyhow::Error> {
        let nk = self.kpts.len();
        let naux = self.naux_full();

        if self.params.compression.is_empty() {
            return Ok(vec![AuxRotation::None; nk]);
        }
        log::info!("Computing compression metric over {nk} momentum points");

        let mut prod: Vec<Array2<Complex64>> = vec![Array2::zeros((naux, naux)); nk];

        let blocks = self.params.compression.iter().copied().sorted().dedup();
        for block in blocks {
            log::debug!("Transforming {block} block");
            let (ci, cj): (Vec<_>, Vec<_>) = match block {
                CompressionBlock::Oo => (self.occ_coeffs(), self.occ_coeffs()),
                CompressionBlock::Ov => (self.occ_coeffs(), self.vir_coeffs()),
                CompressionBlock::Vv => (self.vir_coeffs(), self.vir_coeffs()),
                CompressionBlock::Ia => (self.occ_coeffs_w(), self.vir_coeffs_w()),
            };

            for pair in self.kpts.conserving_pairs() {
                let (q, ki, kj) = (pair.q, pair.k, pair.k_minus_q);
                let ni = ci[ki].ncols();
                let nj = cj[kj].ncols();

                let mut lxy: Array2<Complex64> = Array2::zeros((naux, ni * nj));
                let mut b1 = 0;
                for chunk in self.provider.sr_loop((ki, kj)) {
                    let block = complex_chunk(&chunk, (ki, kj))?;
                    let (b0, b1_new) = (b1, b1 + chunk.naux());
                    b1 = b1_new;

                    let tmp = orbital_rotate(&block.view(), &ci[ki], &cj[kj]);
                    let tmp = tmp
                        .into_shape((b1 - b0, ni * nj))
                        .expect("Rotated chunk should be contiguous.");
                    lxy.slice_mut(s![b0..b1, ..]).assign(&tmp);
                }

                let lxy_h = lxy.t().mapv(|x| x.conj());
                prod[q].add_assign(&(lxy.dot(&lxy_h) / Complex64::new(nk as f64, 0.0)));
            }
        }

        // The eigendecomposition runs on the designated worker only and the
        // retained bases are broadcast so that every worker applies a single
        // consistent truncation.
        let mut basis = Vec::with_capacity(nk);
        for q in 0..nk {
            let mut rot_q = if ops.is_root() {
                let (eigvals, eigvecs) = prod[q].eigh(UPLO::Lower)?;
                let keep = eigvals
                    .iter()
                    .positions(|e| e.abs() > self.params.compression_tol)
                    .collect_vec();
                eigvecs.select(Axis(1), &keep)
            } else {
                Array2::zeros((0, 0))
            };

            let mut ncols = [rot_q.ncols() as f64];
            ops.broadcast_f64(&mut ncols, 0);
            if !ops.is_root() {
                rot_q = Array2::zeros((naux, ncols[0] as usize));
            }
            broadcast(ops, &mut rot_q, 0);

            if rot_q.ncols() == naux {
                mcgw_output!("No compression found at q-point {q}");
                basis.push(AuxRotation::None);
            } else {
                mcgw_output!(
                    "Compressed auxiliary space from {naux} to {} at q-point {q}",
                    rot_q.ncols()
                );
                basis.push(AuxRotation::Rotation(rot_q));
            }
        }

        Ok(basis)
    }

    // ---------
    // Transform
    // ---------

    /// Builds the requested tensor families for the current orbital
    /// coefficients.
    ///
    /// The raw blocks are streamed pairwise from the provider, rotated into
    /// the requested orbital subspaces, and compressed with the rotation of
    /// the relevant momentum transfer. The `Lai` family is built from the
    /// momentum-inverted pair with the inverted transfer `q -> -q` resolved
    /// through wrap-around. The momentum-point loop is sharded across
    /// workers and the finished blocks are summed collectively so that every
    /// worker holds the complete families.
    pub fn transform<C: CollectiveOps>(
        &mut self,
        need_full: Option<bool>,
        need_px: bool,
        need_ia: bool,
        ops: &C,
    ) -> Result<(), anyhow::Error> {
        if self.rot.is_none() {
            self.rot = Some(self.compute_compression_basis(ops)?);
        }

        let need_full = need_full.unwrap_or(self.params.store_full);
        if !(need_full || need_px || need_ia) {
            return Ok(());
        }
        log::info!("Transforming density-fitted integrals");

        let nk = self.kpts.len();
        let nmo = self.nmo();
        let naux_full = self.naux_full();
        let naux = self.naux();
        let nmo_g = self.nmo_g();
        let nocc_w = self.nocc_w();
        let nvir_w = self.nvir_w();
        let rot = self.rot.clone().expect("Compression basis was just built.");

        let occ_w = self.occ_coeffs_w();
        let vir_w = self.vir_coeffs_w();

        let mut lpq = PairMap3::default();
        let mut lpx = PairMap3::default();
        let mut lia = PairMap2::default();
        let mut lai = PairMap2::default();

        for q in 0..nk {
            for ki in 0..nk {
                let kj = self.kpts.sum(q, ki)?;
                let owned = ops.owns(ki);

                let mut lpq_k: Array3<Complex64> = Array3::zeros((naux_full, nmo, nmo));
                let mut lpx_k: Array3<Complex64> = Array3::zeros((naux[q], nmo, nmo_g[kj]));
                let mut lia_k: Array2<Complex64> =
                    Array2::zeros((naux[q], nocc_w[ki] * nvir_w[kj]));

                if owned {
                    let mut b1 = 0;
                    for chunk in self.provider.sr_loop((ki, kj)) {
                        let block = complex_chunk(&chunk, (ki, kj))?;
                        let (b0, b1_new) = (b1, b1 + chunk.naux());
                        b1 = b1_new;
                        log::debug!("  Block [{ki}, {kj}, {b0}:{b1}]");

                        if need_full {
                            let tmp = orbital_rotate(
                                &block.view(),
                                &self.mo_coeff[ki],
                                &self.mo_coeff[kj],
                            );
                            lpq_k.slice_mut(s![b0..b1, .., ..]).assign(&tmp);
                        }

                        if !(need_px || need_ia) {
                            continue;
                        }
                        let block_comp = compress_aux(&block.view(), &rot[q], b0, naux_full);

                        if need_px {
                            lpx_k.add_assign(&orbital_rotate(
                                &block_comp.view(),
                                &self.mo_coeff[ki],
                                &self.mo_coeff_g()[kj],
                            ));
                        }

                        if need_ia {
                            let tmp =
                                orbital_rotate(&block_comp.view(), &occ_w[ki], &vir_w[kj]);
                            let tmp = tmp
                                .into_shape((naux[q], nocc_w[ki] * nvir_w[kj]))
                                .expect("Rotated chunk should be contiguous.");
                            lia_k.add_assign(&tmp);
                        }
                    }
                }

                if need_full {
                    lpq.insert((ki, kj), lpq_k);
                }
                if need_px {
                    lpx.insert((ki, kj), lpx_k);
                }
                if !need_ia {
                    continue;
                }
                lia.insert((ki, kj), lia_k);

                // Conjugate partner from the inverted transfer, streamed over
                // the swapped pair.
                let q_inv = self.kpts.inverse(q)?;
                let mut lai_k: Array2<Complex64> =
                    Array2::zeros((naux[q_inv], nocc_w[ki] * nvir_w[kj]));

                if owned {
                    let mut b1 = 0;
                    for chunk in self.provider.sr_loop((kj, ki)) {
                        let block = complex_chunk(&chunk, (kj, ki))?;
                        let (b0, b1_new) = (b1, b1 + chunk.naux());
                        b1 = b1_new;
                        log::debug!("  Block [{kj}, {ki}, {b0}:{b1}] (inverse)");

                        let block_comp = compress_aux(&block.view(), &rot[q_inv], b0, naux_full);
                        let tmp = orbital_rotate(&block_comp.view(), &vir_w[kj], &occ_w[ki]);
                        // (aux, vir, occ) -> (aux, occ, vir) before flattening.
                        let tmp = tmp.permuted_axes([0, 2, 1]);
                        let tmp = tmp
                            .as_standard_layout()
                            .into_owned()
                            .into_shape((naux[q_inv], nocc_w[ki] * nvir_w[kj]))
                            .expect("Swapped chunk should be contiguous.");
                        lai_k.add_assign(&tmp);
                    }
                }

                lai.insert((ki, kj), lai_k);
            }
        }

        // Sharded workers built disjoint pairs; sum so everyone holds all of
        // them.
        if ops.size() > 1 {
            for arr in lpq.values_mut() {
                allreduce_sum(ops, arr);
            }
            for arr in lpx.values_mut() {
                allreduce_sum(ops, arr);
            }
            for arr in lia.values_mut() {
                allreduce_sum(ops, arr);
            }
            for arr in lai.values_mut() {
                allreduce_sum(ops, arr);
            }
        }

        self.lpq = lpq;
        self.lpx = lpx;
        self.lia = lia;
        self.lai = lai;

        Ok(())
    }

    // --------------------------
    // Coulomb and exchange terms
    // --------------------------

    /// Builds the Coulomb matrix from an MO-basis density matrix.
    ///
    /// Uses the direct contraction over the stored full tensor when it is
    /// retained; otherwise re-streams the provider in chunks, performing the
    /// same contraction without materialising the full tensor.
    pub fn get_j<C: CollectiveOps>(
        &self,
        dm: &[Array2<Complex64>],
        ops: &C,
    ) -> Result<Vec<Array2<Complex64>>, anyhow::Error> {
        let nk = self.kpts.len();
        let nmo = self.nmo();
        let naux_full = self.naux_full();
        ensure!(dm.len() == nk, "Density matrix must cover every momentum point.");

        let mut vj: Vec<Array2<Complex64>> = vec![Array2::zeros((nmo, nmo)); nk];

        if self.params.store_full {
            let mut buf: Array1<Complex64> = Array1::zeros(naux_full);
            for kk in self.kpts.points_sharded(ops) {
                let lpq = &self.lpq[&(kk, kk)];
                let dm_conj = dm[kk].mapv(|x| x.conj());
                buf.add_assign(&trace_contract(&lpq.view(), &dm_conj.view()));
            }
            allreduce_sum(ops, &mut buf);

            for ki in self.kpts.points_sharded(ops) {
                let lpq = &self.lpq[&(ki, ki)];
                vj[ki].add_assign(&weight_contract(&lpq.view(), &buf.view()));
            }
        } else {
            let dm_ao = self.dm_to_ao(dm);

            let mut buf: Array1<Complex64> = Array1::zeros(naux_full);
            for kk in self.kpts.points_sharded(ops) {
                let dm_conj = dm_ao[kk].mapv(|x| x.conj());
                let mut b1 = 0;
                for chunk in self.provider.sr_loop((kk, kk)) {
                    let block = complex_chunk(&chunk, (kk, kk))?;
                    let (b0, b1_new) = (b1, b1 + chunk.naux());
                    b1 = b1_new;
                    buf.slice_mut(s![b0..b1])
                        .add_assign(&trace_contract(&block.view(), &dm_conj.view()));
                }
            }
            allreduce_sum(ops, &mut buf);

            let mut vj_ao: Vec<Array2<Complex64>> =
                vec![Array2::zeros((self.provider.nao(), self.provider.nao())); nk];
            for ki in self.kpts.points_sharded(ops) {
                let mut b1 = 0;
                for chunk in self.provider.sr_loop((ki, ki)) {
                    let block = complex_chunk(&chunk, (ki, ki))?;
                    let (b0, b1_new) = (b1, b1 + chunk.naux());
                    b1 = b1_new;
                    vj_ao[ki].add_assign(&weight_contract(
                        &block.view(),
                        &buf.slice(s![b0..b1]),
                    ));
                }
            }
            for (ki, v) in vj_ao.into_iter().enumerate() {
                vj[ki] = self.ao_to_mo(&v, ki);
            }
        }

        for v in vj.iter_mut() {
            allreduce_sum(ops, v);
            v.mapv_inplace(|x| x / nk as f64);
        }

        Ok(vj)
    }

    /// Builds the exchange matrix from an MO-basis density matrix.
    ///
    /// As for [`Self::get_j`], a fast path contracts the stored full tensor
    /// in auxiliary chunks while the memory-bounded path re-streams the
    /// provider. With `ewald` the periodic probe-charge divergence at zero
    /// momentum transfer is corrected using the configured Madelung
    /// constant.
    pub fn get_k<C: CollectiveOps>(
        &self,
        dm: &[Array2<Complex64>],
        ewald: bool,
        ops: &C,
    ) -> Result<Vec<Array2<Complex64>>, anyhow::Error> {
        let nk = self.kpts.len();
        let nmo = self.nmo();
        let naux_full = self.naux_full();
        ensure!(dm.len() == nk, "Density matrix must cover every momentum point.");

        let mut vk: Vec<Array2<Complex64>> = vec![Array2::zeros((nmo, nmo)); nk];

        if self.params.store_full {
            for b0 in (0..naux_full).step_by(AUX_BLKSIZE) {
                let b1 = naux_full.min(b0 + AUX_BLKSIZE);
                let mut buf: Array3<Complex64> = Array3::zeros((nk * nk, b1 - b0, nmo * nmo));
                for ki in self.kpts.points_sharded(ops) {
                    for kk in 0..nk {
                        let lpq = self.lpq[&(ki, kk)].slice(s![b0..b1, .., ..]);
                        let tmp = density_weighted(&lpq, &dm[kk].view());
                        buf.index_axis_mut(Axis(0), kk * nk + ki).assign(
                            &tmp.into_shape((b1 - b0, nmo * nmo))
                                .expect("Contracted chunk should be contiguous."),
                        );
                    }
                }
                allreduce_sum(ops, &mut buf);

                for ki in 0..nk {
                    for kk in self.kpts.points_sharded(ops) {
                        let lrs = self.lpq[&(kk, ki)].slice(s![b0..b1, .., ..]);
                        let lrp = buf
                            .index_axis(Axis(0), kk * nk + ki)
                            .into_shape((b1 - b0, nmo, nmo))
                            .expect("Buffer chunk should be contiguous.");
                        vk[ki].add_assign(&exchange_contract(&lrp, &lrs));
                    }
                }
            }
        } else {
            let nao = self.provider.nao();
            let dm_ao = self.dm_to_ao(dm);
            let mut vk_ao: Vec<Array2<Complex64>> = vec![Array2::zeros((nao, nao)); nk];

            for kk in 0..nk {
                let mut buf: Array3<Complex64> = Array3::zeros((nk, naux_full, nao * nao));
                for ki in self.kpts.points_sharded(ops) {
                    let mut b1 = 0;
                    for chunk in self.provider.sr_loop((ki, kk)) {
                        let block = complex_chunk(&chunk, (ki, kk))?;
                        let (b0, b1_new) = (b1, b1 + chunk.naux());
                        b1 = b1_new;
                        let tmp = density_weighted(&block.view(), &dm_ao[kk].view());
                        buf.slice_mut(s![ki, b0..b1, ..]).assign(
                            &tmp.into_shape((b1 - b0, nao * nao))
                                .expect("Contracted chunk should be contiguous."),
                        );
                    }
                }
                allreduce_sum(ops, &mut buf);

                for ki in self.kpts.points_sharded(ops) {
                    let mut b1 = 0;
                    for chunk in self.provider.sr_loop((kk, ki)) {
                        let block = complex_chunk(&chunk, (kk, ki))?;
                        let (b0, b1_new) = (b1, b1 + chunk.naux());
                        b1 = b1_new;
                        let lrp = buf
                            .slice(s![ki, b0..b1, ..])
                            .into_shape((b1 - b0, nao, nao))
                            .expect("Buffer chunk should be contiguous.");
                        vk_ao[ki].add_assign(&exchange_contract(&lrp, &block.view()));
                    }
                }
            }

            for (ki, v) in vk_ao.into_iter().enumerate() {
                vk[ki] = self.ao_to_mo(&v, ki);
            }
        }

        for v in vk.iter_mut() {
            allreduce_sum(ops, v);
            v.mapv_inplace(|x| x / nk as f64);
        }

        if ewald {
            // MO-basis overlap is the identity, so the probe-charge term is
            // just the scaled density matrix.
            for (v, d) in vk.iter_mut().zip(dm.iter()) {
                v.add_assign(&d.mapv(|x| x * self.params.madelung));
            }
        }

        Ok(vk)
    }

    /// Builds the Fock matrix `h1e + J - K/2` from an MO-basis density
    /// matrix and core Hamiltonian.
    pub fn get_fock<C: CollectiveOps>(
        &self,
        dm: &[Array2<Complex64>],
        h1e: &[Array2<Complex64>],
        ops: &C,
    ) -> Result<Vec<Array2<Complex64>>, anyhow::Error> {
        let vj = self.get_j(dm, ops)?;
        let vk = self.get_k(dm, false, ops)?;
        Ok(h1e
            .iter()
            .zip(vj.iter().zip(vk.iter()))
            .map(|(h, (j, k))| h + j - &k.mapv(|x| 0.5 * x))
            .collect())
    }

    // -------
    // Helpers
    // -------

    fn occ_coeffs(&self) -> Vec<Array2<Complex64>> {
        self.mo_coeff
            .iter()
            .zip(self.mo_occ.iter())
            .map(|(c, o)| select_columns(c, o, true))
            .collect()
    }

    fn vir_coeffs(&self) -> Vec<Array2<Complex64>> {
        self.mo_coeff
            .iter()
            .zip(self.mo_occ.iter())
            .map(|(c, o)| select_columns(c, o, false))
            .collect()
    }

    fn occ_coeffs_w(&self) -> Vec<Array2<Complex64>> {
        self.mo_coeff_w()
            .iter()
            .zip(self.mo_occ_w().iter())
            .map(|(c, o)| select_columns(c, o, true))
            .collect()
    }

    fn vir_coeffs_w(&self) -> Vec<Array2<Complex64>> {
        self.mo_coeff_w()
            .iter()
            .zip(self.mo_occ_w().iter())
            .map(|(c, o)| select_columns(c, o, false))
            .collect()
    }

    fn dm_to_ao(&self, dm: &[Array2<Complex64>]) -> Vec<Array2<Complex64>> {
        dm.iter()
            .zip(self.mo_coeff.iter())
            .map(|(d, c)| {
                let c_h = c.t().mapv(|x| x.conj());
                c.dot(d).dot(&c_h)
            })
            .collect()
    }

    fn ao_to_mo(&self, m: &Array2<Complex64>, k: usize) -> Array2<Complex64> {
        let c = &self.mo_coeff[k];
        let c_h = c.t().mapv(|x| x.conj());
        c_h.dot(m).dot(c)
    }
}

/// Selects the occupied (`occupied = true`) or virtual columns of an orbital
/// coefficient matrix according to the occupation numbers.
fn select_columns(
    coeff: &Array2<Complex64>,
    occ: &Array1<f64>,
    occupied: bool,
) -> Array2<Complex64> {
    let cols = occ
        .iter()
        .positions(|&o| if occupied { o > 0.0 } else { o == 0.0 })
        .collect_vec();
    coeff.select(Axis(1), &cols)
}

fn count_occ(occ: &Array1<f64>) -> usize {
    occ.iter().filter(|&&o| o > 0.0).count()
}

/// Converts a streamed chunk to its complex block, rejecting low-dimensional
/// blocks.
fn complex_chunk(chunk: &DfChunk, pair: (usize, usize)) -> Result<Array3<Complex64>, McGwError> {
    if chunk.dimension == -1 {
        return Err(McGwError::UnsupportedIntegral(format!(
            "low-dimensional density-fitted block at pair ({}, {})",
            pair.0, pair.1
        )));
    }
    Ok(chunk.to_complex())
}

/// Rotates both orbital indices of a chunk:
/// `out[l, i, j] = Σ_pq conj(ci[p, i]) block[l, p, q] cj[q, j]`.
fn orbital_rotate(
    block: &ArrayView3<Complex64>,
    ci: &Array2<Complex64>,
    cj: &Array2<Complex64>,
) -> Array3<Complex64> {
    let ci_c = ci.mapv(|x| x.conj());
    einsum("lpq,pi,qj->lij", &[block, &ci_c.view(), &cj.view()])
        .expect("Orbital rotation contraction should be well-formed.")
        .into_dimensionality::<ndarray::Ix3>()
        .expect("Orbital rotation should produce a rank-3 tensor.")
}

/// Applies the auxiliary compression rotation to a chunk starting at
/// auxiliary row `b0`:
/// `out[Q, p, q] = Σ_l conj(rot[b0 + l, Q]) block[l, p, q]`.
///
/// Without a rotation the chunk is embedded at rows `b0..` of the full
/// auxiliary dimension `naux_full`.
fn compress_aux(
    block: &ArrayView3<Complex64>,
    rot: &AuxRotation,
    b0: usize,
    naux_full: usize,
) -> Array3<Complex64> {
    let (nb, n1, n2) = block.dim();
    match rot {
        AuxRotation::None => {
            // Identity rotation: the chunk occupies its own auxiliary rows.
            // Consumers accumulate over chunks, so embed at the right offset.
            let mut out = Array3::zeros((naux_full, n1, n2));
            out.slice_mut(s![b0..b0 + nb, .., ..]).assign(block);
            out
        }
        AuxRotation::Rotation(r) => {
            let rows = r.slice(s![b0..b0 + nb, ..]);
            let rot_h = rows.t().mapv(|x| x.conj());
            let flat = block
                .to_owned()
                .into_shape((nb, n1 * n2))
                .expect("Chunk should be contiguous.");
            rot_h
                .dot(&flat)
                .into_shape((r.ncols(), n1, n2))
                .expect("Compressed chunk should be contiguous.")
        }
    }
}

/// `out[l] = Σ_pq block[l, p, q] w[p, q]`.
fn trace_contract(
    block: &ArrayView3<Complex64>,
    w: &ArrayView2<Complex64>,
) -> Array1<Complex64> {
    let (nb, n1, n2) = block.dim();
    let flat = block
        .to_owned()
        .into_shape((nb, n1 * n2))
        .expect("Block should be contiguous.");
    let w_flat = w
        .to_owned()
        .into_shape(n1 * n2)
        .expect("Weight matrix should be contiguous.");
    flat.dot(&w_flat)
}

/// `out[p, q] = Σ_l w[l] block[l, p, q]`.
fn weight_contract(
    block: &ArrayView3<Complex64>,
    w: &ndarray::ArrayView1<Complex64>,
) -> Array2<Complex64> {
    let (nb, n1, n2) = block.dim();
    let flat = block
        .to_owned()
        .into_shape((nb, n1 * n2))
        .expect("Block should be contiguous.");
    w.dot(&flat)
        .into_shape((n1, n2))
        .expect("Contracted block should be contiguous.")
}

/// `out[l, r, p] = Σ_q block[l, p, q] dm[q, r]`.
fn density_weighted(
    block: &ArrayView3<Complex64>,
    dm: &ArrayView2<Complex64>,
) -> Array3<Complex64> {
    let (nb, np, _) = block.dim();
    let nr = dm.ncols();
    let mut out = Array3::zeros((nb, nr, np));
    for (l, b) in block.outer_iter().enumerate() {
        // (p, q) . (q, r) -> (p, r), transposed into (r, p).
        out.index_axis_mut(Axis(0), l).assign(&b.dot(dm).t());
    }
    out
}

/// `out[p, s] = Σ_l Σ_r lrp[l, r, p] lrs[l, r, s]`.
fn exchange_contract(
    lrp: &ArrayView3<Complex64>,
    lrs: &ArrayView3<Complex64>,
) -> Array2<Complex64> {
    let np = lrp.len_of(Axis(2));
    let ns = lrs.len_of(Axis(2));
    let mut out = Array2::zeros((np, ns));
    for (bp, bs) in lrp.outer_iter().zip(lrs.outer_iter()) {
        out.add_assign(&bp.t().dot(&bs));
    }
    out
}
