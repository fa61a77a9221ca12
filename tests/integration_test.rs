use indexmap::IndexMap;
use ndarray::{arr1, s, Array1, Array2, Array3, Axis};
use ndarray_linalg::{Eigh, Norm, UPLO};
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mcgw::error::McGwError;
use mcgw::gw::{Kgw, KgwParams, Polarizability, SelfEnergySolver};
use mcgw::ints::{AuxRotation, KIntegrals, KIntegralsParams, TensorProvider};
use mcgw::kpts::KPointMesh;
use mcgw::parallel::SerialCollective;
use mcgw::qsgw::{QsKgw, QsKgwParams};
use mcgw::scf::KScfReference;
use mcgw::tda::TdaSolver;

/// Real symmetric density-fitted blocks with the pair symmetry of physical
/// two-electron integrals in a real Bloch representation.
fn real_symmetric_blocks(
    nk: usize,
    nao: usize,
    naux: usize,
    seed: u64,
) -> IndexMap<(usize, usize), Array3<Complex64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut blocks = IndexMap::new();
    for ki in 0..nk {
        for kj in ki..nk {
            let mut block = Array3::<Complex64>::zeros((naux, nao, nao));
            for l in 0..naux {
                for p in 0..nao {
                    for q in 0..nao {
                        block[(l, p, q)] = Complex64::new(rng.gen_range(-1.0..1.0) * 0.15, 0.0);
                    }
                }
            }
            if ki == kj {
                for l in 0..naux {
                    for p in 0..nao {
                        for q in 0..p {
                            let avg = 0.5 * (block[(l, p, q)] + block[(l, q, p)]);
                            block[(l, p, q)] = avg;
                            block[(l, q, p)] = avg;
                        }
                    }
                }
            }
            let mut partner = Array3::<Complex64>::zeros((naux, nao, nao));
            for l in 0..naux {
                for p in 0..nao {
                    for q in 0..nao {
                        partner[(l, q, p)] = block[(l, p, q)];
                    }
                }
            }
            blocks.insert((ki, kj), block);
            blocks.entry((kj, ki)).or_insert(partner);
        }
    }
    blocks
}

fn identity_orbitals(
    nk: usize,
    nmo: usize,
    nocc: usize,
) -> (Vec<Array2<Complex64>>, Vec<Array1<f64>>) {
    let coeff = vec![Array2::<Complex64>::eye(nmo); nk];
    let mut occ = Array1::<f64>::zeros(nmo);
    occ.slice_mut(s![..nocc]).fill(2.0);
    (coeff, vec![occ; nk])
}

fn synthetic_reference(
    provider: &TensorProvider,
    mesh: &KPointMesh,
    mo_energy: Vec<Array1<f64>>,
    nocc: usize,
) -> KScfReference {
    let nk = mesh.len();
    let nmo = mo_energy[0].len();
    let (coeff, occs) = identity_orbitals(nk, nmo, nocc);

    let params = KIntegralsParams::builder()
        .compression(vec![])
        .build()
        .unwrap();
    let ints = KIntegrals::new(provider, mesh, coeff.clone(), occs.clone(), params).unwrap();
    let ops = SerialCollective;
    let dm: Vec<Array2<Complex64>> = occs
        .iter()
        .map(|o| Array2::from_diag(&o.mapv(|x| Complex64::new(x, 0.0))))
        .collect();
    let vj = ints.get_j(&dm, &ops).unwrap();
    let vk = ints.get_k(&dm, false, &ops).unwrap();

    let hcore: Vec<Array2<Complex64>> = (0..nk)
        .map(|k| {
            let f = Array2::from_diag(&mo_energy[k].mapv(|e| Complex64::new(e, 0.0)));
            f - &vj[k] + &vk[k].mapv(|x| 0.5 * x)
        })
        .collect();
    let ovlp = vec![Array2::<Complex64>::eye(nmo); nk];

    KScfReference::new(mo_energy, coeff, occs, ovlp, hcore).unwrap()
}

/// Scenario A: in the molecular (single momentum point) limit the recursive
/// response moments must match an independently diagonalised reference.
#[test]
fn test_molecular_limit_response_moments_against_eigenbasis() {
    let mesh = KPointMesh::monkhorst_pack([1, 1, 1]);
    let blocks = real_symmetric_blocks(1, 5, 7, 101);
    let provider = TensorProvider::new(blocks, 4).unwrap();
    let (coeff, occ) = identity_orbitals(1, 5, 2);
    let mo_energy = vec![arr1(&[-1.1, -0.4, 0.3, 0.8, 1.5])];
    let nmom_max = 3;

    let params = KIntegralsParams::builder()
        .compression(vec![])
        .build()
        .unwrap();
    let mut ints = KIntegrals::new(&provider, &mesh, coeff, occ.clone(), params).unwrap();
    let ops = SerialCollective;
    ints.transform(Some(false), true, true, &ops).unwrap();

    let solver = TdaSolver::new(&ints, nmom_max, mo_energy.clone(), occ.clone()).unwrap();
    let dd = solver.build_dd_moments(&ops).unwrap();

    // Independent reference: diagonalise the symmetric response generator
    // Phi = diag(e_a - e_i) + 2 L^T L and reassemble the moments from its
    // eigenbasis.
    let lia = ints.lia()[&(0, 0)].mapv(|x| x.re);
    let (nocc, nvir) = (2, 3);
    let mut d = Array1::<f64>::zeros(nocc * nvir);
    for i in 0..nocc {
        for a in 0..nvir {
            d[i * nvir + a] = mo_energy[0][nocc + a] - mo_energy[0][i];
        }
    }
    let phi = Array2::from_diag(&d) + lia.t().dot(&lia).mapv(|x| 2.0 * x);
    let (lam, u) = phi.eigh(UPLO::Lower).unwrap();

    for order in 0..=nmom_max {
        let lam_n = Array2::from_diag(&lam.mapv(|x| x.powi(order as i32)));
        let reference = lia.dot(&u).dot(&lam_n).dot(&u.t());
        let built = dd[0][0][order].mapv(|x| x.re);
        let scale = reference.norm_l2().max(1.0);
        assert!(
            (&built - &reference).norm_l2() < 1e-8 * scale,
            "Response moment {order} deviates from the eigenbasis reference.",
        );
    }
}

/// Scenario B: the stored-tensor and streaming Coulomb/exchange paths agree
/// on a two-point mesh with no auxiliary truncation.
#[test]
fn test_two_point_mesh_jk_paths_agree() {
    let nk = 2;
    let nmo = 4;
    let mesh = KPointMesh::monkhorst_pack([nk, 1, 1]);
    let blocks = real_symmetric_blocks(nk, nmo, 6, 103);
    let provider = TensorProvider::new(blocks, 4).unwrap();
    let (coeff, occ) = identity_orbitals(nk, nmo, 2);
    let ops = SerialCollective;

    let dm: Vec<Array2<Complex64>> = occ
        .iter()
        .map(|o| Array2::from_diag(&o.mapv(|x| Complex64::new(x, 0.0))))
        .collect();

    let params_full = KIntegralsParams::builder()
        .compression(vec![])
        .store_full(true)
        .build()
        .unwrap();
    let mut ints_full =
        KIntegrals::new(&provider, &mesh, coeff.clone(), occ.clone(), params_full).unwrap();
    ints_full.transform(Some(true), false, false, &ops).unwrap();

    let params_stream = KIntegralsParams::builder()
        .compression(vec![])
        .build()
        .unwrap();
    let ints_stream = KIntegrals::new(&provider, &mesh, coeff, occ, params_stream).unwrap();

    let vj_full = ints_full.get_j(&dm, &ops).unwrap();
    let vj_stream = ints_stream.get_j(&dm, &ops).unwrap();
    let vk_full = ints_full.get_k(&dm, false, &ops).unwrap();
    let vk_stream = ints_stream.get_k(&dm, false, &ops).unwrap();
    for k in 0..nk {
        assert!((&vj_full[k] - &vj_stream[k]).norm_l2() < 1e-13);
        assert!((&vk_full[k] - &vk_stream[k]).norm_l2() < 1e-13);
    }
}

/// Scenario C: a zero compression tolerance retains the full auxiliary space
/// at every momentum transfer.
#[test]
fn test_zero_compression_tolerance_is_identity() {
    let nk = 2;
    let mesh = KPointMesh::monkhorst_pack([nk, 1, 1]);
    let naux = 3;
    let blocks = real_symmetric_blocks(nk, 4, naux, 107);
    let provider = TensorProvider::new(blocks, 2).unwrap();
    let (coeff, occ) = identity_orbitals(nk, 4, 1);
    let params = KIntegralsParams::builder()
        .compression_tol(0.0)
        .build()
        .unwrap();
    let mut ints = KIntegrals::new(&provider, &mesh, coeff, occ, params).unwrap();
    let ops = SerialCollective;

    let basis = ints.compute_compression_basis(&ops).unwrap();
    assert!(basis.iter().all(|rot| matches!(rot, AuxRotation::None)));

    ints.transform(Some(false), true, true, &ops).unwrap();
    assert_eq!(ints.naux(), vec![naux; nk]);
}

/// Self-energy moments stay Hermitian on a multi-point mesh at every order.
#[test]
fn test_self_energy_moments_hermitian_on_mesh() {
    let nk = 2;
    let mesh = KPointMesh::monkhorst_pack([nk, 1, 1]);
    let blocks = real_symmetric_blocks(nk, 4, 5, 109);
    let provider = TensorProvider::new(blocks, 3).unwrap();
    let (coeff, occ) = identity_orbitals(nk, 4, 2);
    let mo_energy: Vec<Array1<f64>> = (0..nk)
        .map(|k| arr1(&[-1.0, -0.3, 0.4, 1.2]) + 0.05 * k as f64)
        .collect();
    let nmom_max = 3;

    let params = KIntegralsParams::builder()
        .compression(vec![])
        .build()
        .unwrap();
    let mut ints = KIntegrals::new(&provider, &mesh, coeff, occ.clone(), params).unwrap();
    let ops = SerialCollective;
    ints.transform(Some(false), true, true, &ops).unwrap();

    let solver = TdaSolver::new(&ints, nmom_max, mo_energy, occ).unwrap();
    let dd = solver.build_dd_moments(&ops).unwrap();
    let (th, tp) = solver.build_se_moments(&dd).unwrap();

    for k in 0..nk {
        for order in 0..=nmom_max {
            for stack in [&th[k], &tp[k]] {
                let m = stack.index_axis(Axis(0), order).to_owned();
                let m_h = m.t().mapv(|x| x.conj());
                let scale = m.norm_l2().max(1.0);
                assert!((&m - &m_h).norm_l2() < 1e-8 * scale);
            }
        }
    }
}

/// Scenario D: the quasiparticle self-consistency on a two-electron system
/// converges tightly and lands on the same ionisation/attachment energies
/// through a different extrapolation path.
#[test]
fn test_quasiparticle_self_consistency_two_electron_system() {
    let mesh = KPointMesh::monkhorst_pack([1, 1, 1]);
    let blocks = real_symmetric_blocks(1, 3, 5, 113);
    let provider = TensorProvider::new(blocks, 5).unwrap();
    let mo_energy = vec![arr1(&[-0.55, 0.25, 1.05])];
    let scf = synthetic_reference(&provider, &mesh, mo_energy, 1);
    let ops = SerialCollective;

    let gw_params = KgwParams::builder()
        .integrals(
            KIntegralsParams::builder()
                .compression(vec![])
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    let solver = Kgw::new(&provider, &mesh, &scf, gw_params).unwrap();

    let mut results = Vec::new();
    for diis_space in [8, 5] {
        let params = QsKgwParams::builder()
            .max_cycle(200)
            .conv_tol(1e-9)
            .conv_tol_moms(1e-7)
            .conv_tol_qp(1e-9)
            .diis_space(diis_space)
            .integrals(
                KIntegralsParams::builder()
                    .compression(vec![])
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let driver = QsKgw::new(&provider, &mesh, &scf, &solver, params).unwrap();
        let result = driver.kernel(3, &ops).unwrap();
        assert!(result.converged, "qsKGW must report convergence.");
        let occ_gf = result.gf[0].get_occupied().remove_uncoupled(0.1);
        let vir_gf = result.gf[0].get_virtual().remove_uncoupled(0.1);
        let ip = occ_gf.energies()[occ_gf.npoles() - 1];
        let ea = vir_gf.energies()[0];
        results.push((ip, ea));
    }

    let (ip_a, ea_a) = results[0];
    let (ip_b, ea_b) = results[1];
    assert!((ip_a - ip_b).abs() < 1e-7, "IP not reproducible: {ip_a} vs {ip_b}");
    assert!((ea_a - ea_b).abs() < 1e-7, "EA not reproducible: {ea_a} vs {ea_b}");
}

/// Scenario E: the exact-diagonalisation response variant is refused with no
/// partial computation, both at the builder and at the driver level.
#[test]
fn test_exact_response_variant_is_refused() {
    let mesh = KPointMesh::monkhorst_pack([1, 1, 1]);
    let blocks = real_symmetric_blocks(1, 3, 4, 127);
    let provider = TensorProvider::new(blocks, 4).unwrap();
    let (coeff, occ) = identity_orbitals(1, 3, 1);
    let mo_energy = vec![arr1(&[-0.5, 0.3, 1.0])];
    let ops = SerialCollective;

    let params = KIntegralsParams::builder()
        .compression(vec![])
        .build()
        .unwrap();
    let mut ints = KIntegrals::new(&provider, &mesh, coeff, occ.clone(), params).unwrap();
    ints.transform(Some(false), true, true, &ops).unwrap();
    let solver = TdaSolver::new(&ints, 2, mo_energy.clone(), occ).unwrap();
    let err = solver.build_dd_moments_exact().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<McGwError>(),
        Some(McGwError::UnsupportedIntegral(_))
    ));

    let scf = synthetic_reference(&provider, &mesh, mo_energy, 1);
    let gw_params = KgwParams::builder()
        .polarizability(Polarizability::DtdaExact)
        .build()
        .unwrap();
    let gw = Kgw::new(&provider, &mesh, &scf, gw_params).unwrap();
    assert!(gw.uses_exact_response());
    let err = gw
        .solve(1, scf.mo_energy(), scf.mo_coeff(), &ops)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<McGwError>(),
        Some(McGwError::UnsupportedIntegral(_))
    ));

    let driver = QsKgw::new(&provider, &mesh, &scf, &gw, QsKgwParams::default()).unwrap();
    let err = driver.kernel(1, &ops).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<McGwError>(),
        Some(McGwError::UnsupportedIntegral(_))
    ));
}
