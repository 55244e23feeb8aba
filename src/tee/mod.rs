//! Attestation-gated key release.
//!
//! - Environment detection (Intel SGX, AMD SEV-SNP, Intel TDX) via an ordered rule list
//! - Attestation evidence collection and remote verification
//! - Verdict policy: minimum TCB level and required claims
//! - [`gate::KeyReleaseGate`]: the single place a data key is ever unwrapped

pub mod attestation;
pub mod detect;
pub mod gate;
pub mod policy;
pub mod remote;
