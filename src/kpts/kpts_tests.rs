use approx::assert_relative_eq;
use itertools::Itertools;
use nalgebra::Vector3;
use proptest::prelude::*;

use crate::kpts::KPointMesh;
use crate::parallel::{CollectiveOps, SerialCollective};

#[test]
fn test_kpts_wrap_around_canonical_interval() {
    let v = Vector3::new(0.5, -0.5, 1.25);
    let w = KPointMesh::wrap_around(&v);
    assert_relative_eq!(w[0], -0.5);
    assert_relative_eq!(w[1], -0.5);
    assert_relative_eq!(w[2], 0.25);
}

#[test]
fn test_kpts_member_modulo_lattice() {
    let mesh = KPointMesh::monkhorst_pack([2, 2, 1]);
    assert_eq!(mesh.len(), 4);

    // 0.5 and -0.5 are the same point modulo the reciprocal lattice.
    let idx = mesh
        .member(&Vector3::new(-0.5, 0.0, 0.0))
        .expect("Expected a mesh member.");
    assert_eq!(idx, mesh.member(&Vector3::new(0.5, 0.0, 0.0)).unwrap());
    assert_eq!(idx, mesh.member(&Vector3::new(1.5, 1.0, 2.0)).unwrap());

    assert!(mesh.member(&Vector3::new(0.3, 0.0, 0.0)).is_err());
}

#[test]
fn test_kpts_conserving_pairs_cover_uniform_mesh() {
    let mesh = KPointMesh::monkhorst_pack([3, 1, 1]);
    // A uniform mesh is closed under subtraction, so every (q, k) pair
    // conserves momentum.
    let pairs = mesh.conserving_pairs().collect_vec();
    assert_eq!(pairs.len(), mesh.len() * mesh.len());
    for pair in pairs {
        let expected = KPointMesh::wrap_around(&(mesh[pair.k] - mesh[pair.q]));
        assert_eq!(mesh.member(&expected).unwrap(), pair.k_minus_q);
    }
}

#[test]
fn test_kpts_conserving_triples_resolve_members() {
    let mesh = KPointMesh::monkhorst_pack([2, 2, 1]);
    let triples = mesh.conserving_triples().collect_vec();
    assert_eq!(triples.len(), mesh.len().pow(3));
    for t in triples {
        let ka_q = KPointMesh::wrap_around(&(mesh[t.ka] - mesh[t.q]));
        let kb_q = KPointMesh::wrap_around(&(mesh[t.kb] - mesh[t.q]));
        assert_eq!(mesh.member(&ka_q).unwrap(), t.ka_minus_q);
        assert_eq!(mesh.member(&kb_q).unwrap(), t.kb_minus_q);
    }
}

#[test]
fn test_kpts_inverse_is_involutive() {
    let mesh = KPointMesh::monkhorst_pack([3, 2, 1]);
    for (q, _) in mesh.points() {
        let q_inv = mesh.inverse(q).expect("Uniform meshes close under negation.");
        assert_eq!(mesh.inverse(q_inv).unwrap(), q);
    }
}

#[test]
fn test_kpts_sharded_loops_partition_serially() {
    let mesh = KPointMesh::monkhorst_pack([2, 2, 2]);
    let ops = SerialCollective;
    assert_eq!(ops.size(), 1);
    assert_eq!(
        mesh.conserving_pairs_sharded(&ops).collect_vec(),
        mesh.conserving_pairs().collect_vec(),
    );
    assert_eq!(
        mesh.conserving_triples_sharded(&ops).count(),
        mesh.conserving_triples().count(),
    );
}

proptest! {
    #[test]
    fn test_kpts_wrap_around_idempotent(
        x in -4.0f64..4.0,
        y in -4.0f64..4.0,
        z in -4.0f64..4.0,
    ) {
        let v = Vector3::new(x, y, z);
        let once = KPointMesh::wrap_around(&v);
        let twice = KPointMesh::wrap_around(&once);
        prop_assert!((once - twice).norm() < 1e-14);
        prop_assert!(once.iter().all(|&c| (-0.5..0.5).contains(&c)));
    }

    #[test]
    fn test_kpts_triples_conserve_momentum(
        na in 1usize..4,
        nb in 1usize..4,
        nc in 1usize..3,
    ) {
        let mesh = KPointMesh::monkhorst_pack([na, nb, nc]);
        for t in mesh.conserving_triples() {
            let ka_q = KPointMesh::wrap_around(&(mesh[t.ka] - mesh[t.q]));
            let kb_q = KPointMesh::wrap_around(&(mesh[t.kb] - mesh[t.q]));
            prop_assert!(mesh.member(&ka_q).is_ok());
            prop_assert!(mesh.member(&kb_q).is_ok());
        }
    }
}
