//! VFA-Core: variable flip angle T1 mapping
//!
//! This crate estimates per-voxel T1 maps from two or more spoiled
//! gradient-echo (SPGR/FLASH) images acquired at different excitation flip
//! angles. Ideal spoiling is assumed; no B1 correction is applied.
//!
//! # Modules
//! - `method`: Bruker-style `##$KEY=VALUE` method text parsing
//! - `params`: TR / flip angle inference and resolution with provenance
//! - `fit`: two-point and N-point voxelwise E1/T1 fitting
//! - `utils`: auto-mask and percentile helpers
//! - `nifti_io`: NIfTI volume loading and float32 saving
//! - `error`: error taxonomy

// Core modules
pub mod error;
pub mod fit;
pub mod method;
pub mod params;
pub mod utils;

// I/O modules
pub mod nifti_io;
