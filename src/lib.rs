//#![deny(warnings)]

//! # U2F Enroll
//!
//! Enrollment side of the FIDO U2F protocol: DER codec, attestation
//! anonymization and the enroller state machine driving a helper device.

pub mod base64;
pub mod u2f;
