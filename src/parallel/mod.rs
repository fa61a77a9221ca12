//! Collective operations for data-parallel execution over k-points.
//!
//! The moment-construction pipeline is data-parallel across worker processes
//! over momentum-point indices: every worker runs the same single-threaded
//! control flow on its shard and blocks only at explicit collective
//! synchronisation points (all-reduce sums after distributed accumulations,
//! broadcasts after designated-worker eigendecompositions). The collective
//! contract is injected into the components that need it rather than kept as
//! ambient global state, so that the whole pipeline remains testable in a
//! single process with the no-op [`SerialCollective`].

use ndarray::{ArrayBase, DataMut, Dimension};
use num_complex::Complex64;


/// A trait for the collective operations required by the distributed parts of
/// the pipeline.
///
/// Implementations wrapping a real communicator (*e.g.* an MPI world) must
/// guarantee that `reduce_sum` is an all-reduce (every rank holds the summed
/// result on return) and that `broadcast` overwrites every rank's buffer with
/// the contents held by `root`.
pub trait CollectiveOps {
    /// The index of the calling worker.
    fn rank(&self) -> usize;

    /// The total number of workers.
    fn size(&self) -> usize;

    /// All-reduce sum of a complex buffer in place.
    fn reduce_sum_c64(&self, buf: &mut [Complex64]);

    /// All-reduce sum of a real buffer in place.
    fn reduce_sum_f64(&self, buf: &mut [f64]);

    /// Broadcasts a complex buffer from `root` to all workers in place.
    fn broadcast_c64(&self, buf: &mut [Complex64], root: usize);

    /// Broadcasts a real buffer from `root` to all workers in place.
    fn broadcast_f64(&self, buf: &mut [f64], root: usize);

    /// Returns `true` if the calling worker is the designated root.
    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Returns `true` if the flattened loop index `idx` belongs to the
    /// calling worker under round-robin sharding.
    fn owns(&self, idx: usize) -> bool {
        idx % self.size() == self.rank()
    }
}

/// The no-op collective for single-process execution. All-reduce and
/// broadcast leave buffers untouched; every index is owned.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialCollective;

impl CollectiveOps for SerialCollective {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn reduce_sum_c64(&self, _buf: &mut [Complex64]) {}

    fn reduce_sum_f64(&self, _buf: &mut [f64]) {}

    fn broadcast_c64(&self, _buf: &mut [Complex64], _root: usize) {}

    fn broadcast_f64(&self, _buf: &mut [f64], _root: usize) {}
}

/// All-reduce sums a complex array in place across all workers.
///
/// The array must be contiguous in some memory order, which holds for all
/// owned arrays produced by this crate.
pub fn allreduce_sum<S, D>(ops: &impl CollectiveOps, arr: &mut ArrayBase<S, D>)
where
    S: DataMut<Elem = Complex64>,
    D: Dimension,
{
    let buf = arr
        .as_slice_memory_order_mut()
        .expect("Array to all-reduce is not contiguous.");
    ops.reduce_sum_c64(buf);
}

/// Broadcasts a complex array in place from `root` to all workers.
pub fn broadcast<S, D>(ops: &impl CollectiveOps, arr: &mut ArrayBase<S, D>, root: usize)
where
    S: DataMut<Elem = Complex64>,
    D: Dimension,
{
    let buf = arr
        .as_slice_memory_order_mut()
        .expect("Array to broadcast is not contiguous.");
    ops.broadcast_c64(buf, root);
}

/// Broadcasts a real array in place from `root` to all workers.
pub fn broadcast_real<S, D>(ops: &impl CollectiveOps, arr: &mut ArrayBase<S, D>, root: usize)
where
    S: DataMut<Elem = f64>,
    D: Dimension,
{
    let buf = arr
        .as_slice_memory_order_mut()
        .expect("Array to broadcast is not contiguous.");
    ops.broadcast_f64(buf, root);
}
