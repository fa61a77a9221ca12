//! # mcgw: Moment-Constrained GW on Brillouin-Zone Meshes
//!
//! `mcgw` computes approximate charged excitation spectra (ionisation and
//! attachment energies) of molecular and periodic systems from a mean-field
//! reference using moment-constrained GW theory. Instead of forming the full
//! energy-dependent self-energy, the crate builds a small number of spectral
//! moments of the density-density response by recursion, convolves them into
//! Hermitian self-energy moments, and fits the result to a discrete pole
//! representation of the Green's function.
//!
//! The main entry points are:
//! - [`gw::Kgw`], the one-shot moment-constrained solver, and
//! - [`qsgw::QsKgw`], the quasiparticle self-consistent driver that iterates a
//!   static self-energy potential together with a nested Fock/density fixed
//!   point.
//!
//! Both operate on density-fitted integrals held in an [`ints::KIntegrals`]
//! container over a [`kpts::KPointMesh`], with momentum conservation enforced
//! through wrap-around arithmetic throughout. Distributed execution is
//! expressed through the [`parallel::CollectiveOps`] contract; the provided
//! [`parallel::SerialCollective`] runs the entire pipeline in a single
//! process.

pub mod diis;
pub mod error;
pub mod gw;
pub mod ints;
pub mod io;
pub mod kpts;
pub mod parallel;
pub mod qsgw;
pub mod scf;
pub mod spectral;
pub mod tda;
