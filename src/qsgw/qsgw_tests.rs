use indexmap::IndexMap;
use ndarray::{arr1, s, Array1, Array2, Array3};
use ndarray_linalg::Norm;
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::McGwError;
use crate::gw::{Kgw, KgwParams, Polarizability};
use crate::ints::{KIntegrals, KIntegralsParams, TensorProvider};
use crate::kpts::KPointMesh;
use crate::parallel::SerialCollective;
use crate::qsgw::{ConvLogical, QsKgw, QsKgwParams};
use crate::scf::KScfReference;
use crate::spectral::Lehmann;

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
                        block[(l, p, q)] = Complex64::new(rng.gen_range(-1.0..1.0) * 0.1, 0.0);
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

fn synthetic_reference(
    provider: &TensorProvider,
    mesh: &KPointMesh,
    mo_energy: Vec<Array1<f64>>,
    nocc: usize,
) -> KScfReference {
    let nk = mesh.len();
    let nmo = mo_energy[0].len();
    let coeff = vec![Array2::<Complex64>::eye(nmo); nk];
    let mut occ = Array1::<f64>::zeros(nmo);
    occ.slice_mut(s![..nocc]).fill(2.0);
    let occs = vec![occ; nk];

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

fn driver_params(diis_space: usize) -> QsKgwParams {
    QsKgwParams::builder()
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
        .unwrap()
}

fn frontier_energies(gf: &Lehmann) -> (f64, f64) {
    let occ = gf.get_occupied().remove_uncoupled(0.1);
    let vir = gf.get_virtual().remove_uncoupled(0.1);
    let ip = occ.energies()[occ.npoles() - 1];
    let ea = vir.energies()[0];
    (ip, ea)
}

#[test]
fn test_qsgw_two_electron_system_converges_and_is_reproducible() {
    let mesh = KPointMesh::monkhorst_pack([1, 1, 1]);
    let blocks = real_symmetric_blocks(1, 3, 5, 61);
    let provider = TensorProvider::new(blocks, 5).unwrap();
    let mo_energy = vec![arr1(&[-0.6, 0.3, 1.1])];
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

    let driver = QsKgw::new(&provider, &mesh, &scf, &solver, driver_params(8)).unwrap();
    let result = driver.kernel(3, &ops).unwrap();
    assert!(result.converged, "qsKGW must converge within the budget.");

    // A second run through a different extrapolation path must land on the
    // same fixed point.
    let driver_alt = QsKgw::new(&provider, &mesh, &scf, &solver, driver_params(5)).unwrap();
    let result_alt = driver_alt.kernel(3, &ops).unwrap();
    assert!(result_alt.converged);

    let (ip, ea) = frontier_energies(&result.gf[0]);
    let (ip_alt, ea_alt) = frontier_energies(&result_alt.gf[0]);
    assert!(
        (ip - ip_alt).abs() < 1e-7,
        "Ionisation energies disagree: {ip} vs {ip_alt}",
    );
    assert!(
        (ea - ea_alt).abs() < 1e-7,
        "Attachment energies disagree: {ea} vs {ea_alt}",
    );
}

#[test]
fn test_qsgw_static_potential_regularisations() {
    let mesh = KPointMesh::monkhorst_pack([1, 1, 1]);
    let blocks = real_symmetric_blocks(1, 2, 3, 67);
    let provider = TensorProvider::new(blocks, 3).unwrap();
    let mo_energy = vec![arr1(&[-0.5, 0.5])];
    let scf = synthetic_reference(&provider, &mesh, mo_energy, 1);
    let solver = Kgw::new(&provider, &mesh, &scf, KgwParams::default()).unwrap();

    let se = Lehmann::new(
        arr1(&[-1.2, -0.5, 0.8]),
        ndarray::array![
            [
                Complex64::new(0.4, 0.0),
                Complex64::new(0.2, 0.0),
                Complex64::new(0.1, 0.0)
            ],
            [
                Complex64::new(0.1, 0.0),
                Complex64::new(0.3, 0.0),
                Complex64::new(0.5, 0.0)
            ],
        ],
        0.0,
    )
    .unwrap();

    let driver_eta =
        QsKgw::new(&provider, &mesh, &scf, &solver, QsKgwParams::default()).unwrap();
    let params_srg = QsKgwParams::builder().srg(100.0).build().unwrap();
    let driver_srg = QsKgw::new(&provider, &mesh, &scf, &solver, params_srg).unwrap();

    let pot_eta = driver_eta.build_static_potential(&scf.mo_energy()[0], &se);
    let pot_srg = driver_srg.build_static_potential(&scf.mo_energy()[0], &se);

    for pot in [&pot_eta, &pot_srg] {
        let pot_h = pot.t().mapv(|x| x.conj());
        assert!((pot - &pot_h).norm_l2() < 1e-14, "Static potential must be Hermitian.");
    }
    // A pole degenerate with an orbital energy contributes nothing under the
    // SRG damping, while the eta broadening keeps a finite contribution.
    let se_degenerate = Lehmann::new(
        arr1(&[-0.5]),
        ndarray::array![[Complex64::new(0.7, 0.0)], [Complex64::new(0.0, 0.0)]],
        0.0,
    )
    .unwrap();
    let pot = driver_srg.build_static_potential(&scf.mo_energy()[0], &se_degenerate);
    assert!(pot[(0, 0)].norm() < 1e-14);
}

#[test]
fn test_qsgw_exact_response_variant_is_refused_before_work() {
    let mesh = KPointMesh::monkhorst_pack([1, 1, 1]);
    let blocks = real_symmetric_blocks(1, 2, 3, 71);
    let provider = TensorProvider::new(blocks, 3).unwrap();
    let mo_energy = vec![arr1(&[-0.4, 0.6])];
    let scf = synthetic_reference(&provider, &mesh, mo_energy, 1);
    let params = KgwParams::builder()
        .polarizability(Polarizability::DtdaExact)
        .build()
        .unwrap();
    let solver = Kgw::new(&provider, &mesh, &scf, params).unwrap();
    let driver =
        QsKgw::new(&provider, &mesh, &scf, &solver, QsKgwParams::default()).unwrap();

    let err = driver
        .kernel(1, &SerialCollective)
        .expect_err("The exact response variant must be refused up front.");
    assert!(matches!(
        err.downcast_ref::<McGwError>(),
        Some(McGwError::UnsupportedIntegral(_))
    ));
}

#[test]
fn test_qsgw_budget_exhaustion_reports_nonconvergence() {
    let mesh = KPointMesh::monkhorst_pack([1, 1, 1]);
    let blocks = real_symmetric_blocks(1, 3, 4, 73);
    let provider = TensorProvider::new(blocks, 4).unwrap();
    let mo_energy = vec![arr1(&[-0.6, 0.2, 0.9])];
    let scf = synthetic_reference(&provider, &mesh, mo_energy, 1);
    let solver = Kgw::new(&provider, &mesh, &scf, KgwParams::default()).unwrap();

    let params = QsKgwParams::builder()
        .max_cycle(1)
        .conv_tol(1e-15)
        .conv_tol_moms(1e-15)
        .conv_tol_qp(1e-15)
        .build()
        .unwrap();
    let driver = QsKgw::new(&provider, &mesh, &scf, &solver, params).unwrap();
    let result = driver.kernel(1, &SerialCollective).unwrap();
    assert!(!result.converged, "An exhausted budget reports, not raises.");
}

#[test]
fn test_qsgw_convergence_combinator() {
    let mesh = KPointMesh::monkhorst_pack([1, 1, 1]);
    let blocks = real_symmetric_blocks(1, 2, 3, 79);
    let provider = TensorProvider::new(blocks, 3).unwrap();
    let mo_energy = vec![arr1(&[-0.4, 0.6])];
    let scf = synthetic_reference(&provider, &mesh, mo_energy, 1);
    let solver = Kgw::new(&provider, &mesh, &scf, KgwParams::default()).unwrap();

    let e0 = vec![arr1(&[-0.4, 0.6])];
    let e1 = vec![arr1(&[-0.4 + 1e-3, 0.6])];
    let m0 = vec![Array3::<Complex64>::zeros((2, 2, 2))];

    // Energies moved but moments and density are converged: `all` fails,
    // `any` passes.
    let driver_all =
        QsKgw::new(&provider, &mesh, &scf, &solver, QsKgwParams::default()).unwrap();
    assert!(!driver_all.check_convergence(&e1, &e0, &m0, &m0, &m0, &m0, 0.0));

    let params_any = QsKgwParams::builder()
        .conv_logical(ConvLogical::Any)
        .build()
        .unwrap();
    let driver_any = QsKgw::new(&provider, &mesh, &scf, &solver, params_any).unwrap();
    assert!(driver_any.check_convergence(&e1, &e0, &m0, &m0, &m0, &m0, 0.0));
}
