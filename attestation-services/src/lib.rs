// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//!  Control plane services of a confidential VM cluster.
//!
//!  The [verify service](verify::VerifyService) returns attestation documents
//!  of the node it runs on. The [join service](join::JoinService) hands state
//!  disk keys to rebooted nodes, after checking their attestation against the
//!  cluster's current measurements.

pub mod join;
pub mod keyservice;
pub mod verify;
