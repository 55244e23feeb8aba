//! A3S Vault: attestation-gated envelope encryption and secure loading for
//! model artifacts in TEE environments.

pub mod cli;
pub mod clients;
pub mod config;
pub mod custody;
pub(crate) mod deadline;
pub mod dirs;
pub mod envelope;
pub mod error;
pub(crate) mod lock;
pub mod model;
pub mod readiness;
pub mod tee;

#[doc(hidden)]
pub mod test_utils;
