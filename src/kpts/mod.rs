//! Brillouin-zone meshes and momentum-conservation arithmetic.
//!
//! A [`KPointMesh`] is an ordered, fixed-size collection of momentum points in
//! scaled (fractional) reciprocal coordinates. All momentum arithmetic goes
//! through [`KPointMesh::wrap_around`], which maps an arbitrary vector to its
//! canonical representative with every component in `[-1/2, 1/2)`; the
//! conservation maps `k - q` and `k + q` are precomputed at construction so
//! that the hot loops of the moment recursion never re-derive them.

use std::fmt;
use std::ops::Index;

use itertools::iproduct;
use nalgebra::Vector3;

use crate::error::McGwError;
use crate::parallel::CollectiveOps;

#[cfg(test)]
#[path = "kpts_tests.rs"]
mod kpts_tests;

/// Default tolerance for identifying two wrapped momentum points.
const KPT_MATCH_TOL: f64 = 1e-8;

/// A momentum-conserving pair `(q, k)` together with the resolved mesh index
/// of `k - q`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConservingPair {
    /// Index of the momentum transfer.
    pub q: usize,

    /// Index of the related momentum point.
    pub k: usize,

    /// Mesh index of `k - q` after wrap-around.
    pub k_minus_q: usize,
}

/// A momentum-conserving triple `(q, k_a, k_b)` together with the resolved
/// mesh indices of `k_a - q` and `k_b - q`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConservingTriple {
    /// Index of the momentum transfer.
    pub q: usize,

    /// Index of the first related momentum point.
    pub ka: usize,

    /// Index of the second related momentum point.
    pub kb: usize,

    /// Mesh index of `k_a - q` after wrap-around.
    pub ka_minus_q: usize,

    /// Mesh index of `k_b - q` after wrap-around.
    pub kb_minus_q: usize,
}

/// An ordered mesh of momentum points sampling the Brillouin zone.
#[derive(Clone, Debug)]
pub struct KPointMesh {
    /// The momentum points in scaled coordinates, each stored in canonical
    /// wrapped form.
    kpts: Vec<Vector3<f64>>,

    /// Tolerance for identifying two wrapped momentum points.
    tol: f64,

    /// `diff[k][q]` holds the mesh index of `k - q` after wrap-around, if any.
    diff: Vec<Vec<Option<usize>>>,

    /// `sum[q][k]` holds the mesh index of `q + k` after wrap-around, if any.
    sum: Vec<Vec<Option<usize>>>,

    /// `inv[q]` holds the mesh index of `-q` after wrap-around, if any.
    inv: Vec<Option<usize>>,
}

impl KPointMesh {
    /// Constructs a mesh from a list of scaled momentum points with the
    /// default matching tolerance.
    pub fn new(kpts: Vec<Vector3<f64>>) -> Self {
        Self::with_tolerance(kpts, KPT_MATCH_TOL)
    }

    /// Constructs a mesh from a list of scaled momentum points.
    pub fn with_tolerance(kpts: Vec<Vector3<f64>>, tol: f64) -> Self {
        let kpts: Vec<Vector3<f64>> = kpts.iter().map(Self::wrap_around).collect();
        let lookup = |v: &Vector3<f64>| {
            kpts.iter()
                .position(|k| Self::wrap_around(&(v - k)).norm() < tol)
        };
        let diff = kpts
            .iter()
            .map(|kk| kpts.iter().map(|kq| lookup(&(kk - kq))).collect())
            .collect();
        let sum = kpts
            .iter()
            .map(|kq| kpts.iter().map(|kk| lookup(&(kq + kk))).collect())
            .collect();
        let inv = kpts.iter().map(|kq| lookup(&(-kq))).collect();
        Self {
            kpts,
            tol,
            diff,
            sum,
            inv,
        }
    }

    /// Constructs a uniform Γ-centred Monkhorst–Pack mesh with the given
    /// number of divisions along each reciprocal axis.
    pub fn monkhorst_pack(shape: [usize; 3]) -> Self {
        assert!(shape.iter().all(|&n| n > 0), "Empty mesh axis.");
        let kpts = iproduct!(0..shape[0], 0..shape[1], 0..shape[2])
            .map(|(i, j, k)| {
                Vector3::new(
                    i as f64 / shape[0] as f64,
                    j as f64 / shape[1] as f64,
                    k as f64 / shape[2] as f64,
                )
            })
            .collect();
        Self::new(kpts)
    }

    /// Maps a scaled momentum vector to its canonical representative with
    /// every component in `[-1/2, 1/2)`. Idempotent.
    pub fn wrap_around(v: &Vector3<f64>) -> Vector3<f64> {
        v.map(|x| (x + 0.5).rem_euclid(1.0) - 0.5)
    }

    /// Returns the mesh index of the momentum point coinciding with `v`
    /// within the matching tolerance.
    ///
    /// # Errors
    ///
    /// [`McGwError::Lookup`] if no mesh point matches, which indicates a
    /// momentum-conservation bug in the caller.
    pub fn member(&self, v: &Vector3<f64>) -> Result<usize, McGwError> {
        self.kpts
            .iter()
            .position(|k| Self::wrap_around(&(v - k)).norm() < self.tol)
            .ok_or_else(|| {
                McGwError::Lookup(format!(
                    "momentum point ({:+.6}, {:+.6}, {:+.6}) is not a member of the mesh",
                    v[0], v[1], v[2]
                ))
            })
    }

    /// The number of momentum points in the mesh.
    pub fn len(&self) -> usize {
        self.kpts.len()
    }

    /// Returns `true` if the mesh holds no momentum points.
    pub fn is_empty(&self) -> bool {
        self.kpts.is_empty()
    }

    /// The mesh index of `k - q` after wrap-around.
    pub fn diff(&self, k: usize, q: usize) -> Result<usize, McGwError> {
        self.diff[k][q].ok_or_else(|| {
            McGwError::Lookup(format!(
                "difference of mesh points {k} and {q} does not resolve to a mesh member"
            ))
        })
    }

    /// The mesh index of `q + k` after wrap-around.
    pub fn sum(&self, q: usize, k: usize) -> Result<usize, McGwError> {
        self.sum[q][k].ok_or_else(|| {
            McGwError::Lookup(format!(
                "sum of mesh points {q} and {k} does not resolve to a mesh member"
            ))
        })
    }

    /// The mesh index of `-q` after wrap-around.
    pub fn inverse(&self, q: usize) -> Result<usize, McGwError> {
        self.inv[q].ok_or_else(|| {
            McGwError::Lookup(format!(
                "negation of mesh point {q} does not resolve to a mesh member"
            ))
        })
    }

    /// Iterates over `(index, point)` for every momentum point.
    pub fn points(&self) -> impl Iterator<Item = (usize, &Vector3<f64>)> + '_ {
        self.kpts.iter().enumerate()
    }

    /// Iterates over the shard of momentum-point indices owned by the calling
    /// worker under round-robin assignment.
    pub fn points_sharded<'a, C: CollectiveOps>(
        &'a self,
        ops: &'a C,
    ) -> impl Iterator<Item = usize> + 'a {
        (0..self.kpts.len()).filter(|&k| ops.owns(k))
    }

    /// Iterates over every momentum-conserving pair `(q, k)`, *i.e.* every
    /// pair for which `k - q` wraps onto a mesh member.
    pub fn conserving_pairs(&self) -> impl Iterator<Item = ConservingPair> + '_ {
        let nk = self.kpts.len();
        iproduct!(0..nk, 0..nk).filter_map(move |(q, k)| {
            self.diff[k][q].map(|k_minus_q| ConservingPair { q, k, k_minus_q })
        })
    }

    /// Iterates over the momentum-conserving pairs owned by the calling
    /// worker. The flattened enumeration index of the pair is assigned
    /// round-robin across workers, so the union over all workers enumerates
    /// every conserving pair exactly once.
    pub fn conserving_pairs_sharded<'a, C: CollectiveOps>(
        &'a self,
        ops: &'a C,
    ) -> impl Iterator<Item = ConservingPair> + 'a {
        self.conserving_pairs()
            .enumerate()
            .filter(|(idx, _)| ops.owns(*idx))
            .map(|(_, pair)| pair)
    }

    /// Iterates over every momentum-conserving triple `(q, k_a, k_b)`,
    /// *i.e.* every triple for which both `k_a - q` and `k_b - q` wrap onto
    /// mesh members.
    pub fn conserving_triples(&self) -> impl Iterator<Item = ConservingTriple> + '_ {
        let nk = self.kpts.len();
        iproduct!(0..nk, 0..nk, 0..nk).filter_map(move |(q, ka, kb)| {
            match (self.diff[ka][q], self.diff[kb][q]) {
                (Some(ka_minus_q), Some(kb_minus_q)) => Some(ConservingTriple {
                    q,
                    ka,
                    kb,
                    ka_minus_q,
                    kb_minus_q,
                }),
                _ => None,
            }
        })
    }

    /// Iterates over the momentum-conserving triples owned by the calling
    /// worker under round-robin assignment of the flattened enumeration
    /// index.
    pub fn conserving_triples_sharded<'a, C: CollectiveOps>(
        &'a self,
        ops: &'a C,
    ) -> impl Iterator<Item = ConservingTriple> + 'a {
        self.conserving_triples()
            .enumerate()
            .filter(|(idx, _)| ops.owns(*idx))
            .map(|(_, triple)| triple)
    }
}

impl Index<usize> for KPointMesh {
    type Output = Vector3<f64>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.kpts[index]
    }
}

impl fmt::Display for KPointMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Momentum mesh with {} points:", self.len())?;
        for (i, k) in self.points() {
            writeln!(f, "  {i:>3}  ({:+.6}, {:+.6}, {:+.6})", k[0], k[1], k[2])?;
        }
        Ok(())
    }
}
