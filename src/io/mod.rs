//! Input/output routines.

pub mod format;
