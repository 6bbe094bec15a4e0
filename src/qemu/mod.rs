// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! QEMU guests. Nothing vouches for the vTPM, so these variants are only fit
//! for development clusters.

pub mod tdx;
pub mod vtpm;
