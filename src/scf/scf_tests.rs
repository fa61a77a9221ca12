use ndarray::{arr1, Array1, Array2};
use ndarray_linalg::Norm;
use num_complex::Complex64;

use crate::scf::{density_from_orbitals, KScfReference};

fn eye(n: usize) -> Array2<Complex64> {
    Array2::eye(n)
}

#[test]
fn test_scf_reference_density_is_idempotent_under_overlap() {
    let nmo = 3;
    let mo_energy = vec![arr1(&[-0.5, 0.2, 0.9])];
    let mo_coeff = vec![eye(nmo)];
    let mo_occ = vec![arr1(&[2.0, 0.0, 0.0])];
    let scf = KScfReference::new(
        mo_energy,
        mo_coeff,
        mo_occ,
        vec![eye(nmo)],
        vec![Array2::zeros((nmo, nmo))],
    )
    .unwrap();

    let dm = scf.make_rdm1();
    // D S D = 2 D for a doubly occupied idempotent density.
    let dsd = dm[0].dot(&scf.ovlp()[0]).dot(&dm[0]);
    assert!((&dsd - &dm[0].mapv(|x| x * 2.0)).norm_l2() < 1e-14);
    assert!((scf.nelec()[0] - 2.0).abs() < 1e-14);
}

#[test]
fn test_scf_density_from_rotated_orbitals_preserves_trace() {
    let theta: f64 = 0.3;
    let u = ndarray::array![
        [
            Complex64::new(theta.cos(), 0.0),
            Complex64::new(-theta.sin(), 0.0)
        ],
        [
            Complex64::new(theta.sin(), 0.0),
            Complex64::new(theta.cos(), 0.0)
        ],
    ];
    let occ = vec![arr1(&[2.0, 0.0])];
    let dm = density_from_orbitals(&[u], &occ);
    let trace: Complex64 = (0..2).map(|i| dm[0][(i, i)]).sum();
    assert!((trace.re - 2.0).abs() < 1e-14);
    assert!(trace.im.abs() < 1e-14);
}

#[test]
fn test_scf_reference_rejects_mismatched_shapes() {
    let res = KScfReference::new(
        vec![arr1(&[0.0, 1.0])],
        vec![eye(2)],
        vec![Array1::zeros(3)],
        vec![eye(2)],
        vec![eye(2)],
    );
    assert!(res.is_err());
}
