use ndarray::{arr1, Array1, Array2};
use ndarray_linalg::Norm;
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::spectral::{binsearch_chempot, dyson_supermatrix, Lehmann};

fn random_poles(nphys: usize, npoles: usize, seed: u64) -> Lehmann {
    let mut rng = StdRng::seed_from_u64(seed);
    let energies = Array1::from_iter(
        (0..npoles).map(|k| -2.0 + 4.0 * k as f64 / npoles as f64 + rng.gen_range(-0.1..0.1)),
    );
    let couplings = Array2::from_shape_fn((nphys, npoles), |_| {
        Complex64::new(rng.gen_range(-0.5..0.5), rng.gen_range(-0.5..0.5))
    });
    Lehmann::new(energies, couplings, 0.0).unwrap()
}

#[test]
fn test_spectral_from_moments_conserves_moments() {
    let exact = random_poles(3, 8, 5);
    let nmom_max = 3;
    let moments = exact.moments(nmom_max);

    let fitted = Lehmann::from_moments(&moments, 0.0).unwrap();
    assert_eq!(fitted.nphys(), 3);
    // One block iteration yields two blocks of poles.
    assert_eq!(fitted.npoles(), 6);

    for (n, reference) in moments.iter().enumerate() {
        let rebuilt = fitted.moment(n);
        let scale = reference.norm_l2().max(1.0);
        assert!(
            (&rebuilt - reference).norm_l2() < 1e-8 * scale,
            "Fitted representation fails to conserve moment {n}.",
        );
    }
}

#[test]
fn test_spectral_from_moments_single_pair_reproduces_first_two() {
    let exact = random_poles(2, 5, 9);
    let moments = exact.moments(1);
    let fitted = Lehmann::from_moments(&moments, 0.0).unwrap();
    assert_eq!(fitted.npoles(), 2);
    for n in 0..=1 {
        let scale = moments[n].norm_l2().max(1.0);
        assert!((&fitted.moment(n) - &moments[n]).norm_l2() < 1e-10 * scale);
    }
}

#[test]
fn test_spectral_occupied_virtual_split() {
    let poles = Lehmann::new(
        arr1(&[-1.5, -0.2, 0.3, 2.0]),
        Array2::from_shape_fn((2, 4), |(p, k)| Complex64::new((p + k) as f64 * 0.1 + 0.05, 0.0)),
        0.0,
    )
    .unwrap();

    let occ = poles.get_occupied();
    let vir = poles.get_virtual();
    assert_eq!(occ.npoles(), 2);
    assert_eq!(vir.npoles(), 2);
    assert!(occ.energies().iter().all(|&e| e < 0.0));
    assert!(vir.energies().iter().all(|&e| e >= 0.0));
    // The split partitions the zeroth moment.
    let total = poles.moment(0);
    let sum = occ.moment(0) + vir.moment(0);
    assert!((&total - &sum).norm_l2() < 1e-14);
}

#[test]
fn test_spectral_remove_uncoupled_prunes_weightless_poles() {
    let mut couplings = Array2::<Complex64>::zeros((2, 3));
    couplings[(0, 0)] = Complex64::new(0.8, 0.0);
    couplings[(1, 2)] = Complex64::new(0.6, 0.1);
    // Pole 1 carries no weight at all.
    let poles = Lehmann::new(arr1(&[-1.0, 0.0, 1.0]), couplings, 0.5).unwrap();
    let pruned = poles.remove_uncoupled(1e-8);
    assert_eq!(pruned.npoles(), 2);
    assert_eq!(pruned.energies(), &arr1(&[-1.0, 1.0]));
}

#[test]
fn test_spectral_dyson_supermatrix_interleaves_poles() {
    // With vanishing couplings the supermatrix block-diagonalises: the
    // Green's function poles are the static eigenvalues plus the bare
    // self-energy poles.
    let static_se = Array2::from_diag(&arr1(&[
        Complex64::new(-1.0, 0.0),
        Complex64::new(1.0, 0.0),
    ]));
    let se = Lehmann::new(arr1(&[-3.0, 3.0]), Array2::zeros((2, 2)), 0.0).unwrap();
    let gf = dyson_supermatrix(&static_se, &se).unwrap();
    let mut energies = gf.energies().to_vec();
    energies.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let expected = [-3.0, -1.0, 1.0, 3.0];
    for (e, r) in energies.iter().zip(expected.iter()) {
        assert!((e - r).abs() < 1e-12);
    }
}

#[test]
fn test_spectral_chempot_brackets_electron_count() {
    // Two fully coupled poles; two electrons fill exactly one of them.
    let mut couplings = Array2::<Complex64>::zeros((2, 2));
    couplings[(0, 0)] = Complex64::new(1.0, 0.0);
    couplings[(1, 1)] = Complex64::new(1.0, 0.0);
    let gf = Lehmann::new(arr1(&[-0.6, 0.4]), couplings, 0.0).unwrap();

    let (chempot, error) = binsearch_chempot(&gf, 2.0);
    assert!(error < 1e-14);
    assert!((-0.6..0.4).contains(&chempot));
}
