//! CLI argument parsing for a3s-vault.
//!
//! Subcommands:
//!   encrypt: Envelope-encrypt one model file, or a directory with `--batch`
//!   decrypt: Attest, then decrypt an artifact to an explicit path
//!   load   : Materialize an artifact through the full pipeline
//!   info   : Show an artifact's encryption metadata
//!   attest : Detect the TEE and print the attestation verdict
//!   probe  : Readiness probe (exit 0 = ready, 1 = not ready)

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// A3S Vault: attestation-gated envelope encryption for model artifacts.
#[derive(Parser, Debug)]
#[command(name = "a3s-vault", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file path (default: $A3S_VAULT_HOME/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Encrypt a model file (or every matching file with --batch)
    Encrypt(EncryptArgs),

    /// Decrypt an encrypted model to a file
    Decrypt(DecryptArgs),

    /// Decrypt, verify and load a model, then release it
    Load(LoadArgs),

    /// Show encryption metadata for an artifact
    Info(InfoArgs),

    /// Detect the TEE environment and print the attestation verdict
    Attest,

    /// Run the readiness checks
    Probe(ProbeArgs),
}

/// Arguments for the `encrypt` subcommand.
#[derive(Parser, Debug)]
pub struct EncryptArgs {
    /// Model file, or model directory with --batch
    #[arg(long)]
    pub model: PathBuf,

    /// Encrypted output file, or output directory with --batch
    #[arg(long)]
    pub output: PathBuf,

    /// Metadata output path (default: <output>.metadata.json)
    #[arg(long, conflicts_with = "batch")]
    pub metadata: Option<PathBuf>,

    /// Custodian key reference (default: custodian.key_ref from config)
    #[arg(long)]
    pub key_ref: Option<String>,

    /// Encrypt every file in --model matching --pattern
    #[arg(long)]
    pub batch: bool,

    /// File name glob for --batch (`*`, `?`, `[...]`)
    #[arg(long, default_value = "*.pt", requires = "batch")]
    pub pattern: String,
}

/// Arguments for the `decrypt` subcommand.
#[derive(Parser, Debug)]
pub struct DecryptArgs {
    /// Encrypted model file, or directory with --batch
    #[arg(long)]
    pub encrypted_model: PathBuf,

    /// Decrypted output file, or output directory with --batch
    #[arg(long)]
    pub output: PathBuf,

    /// Metadata path (default: <encrypted-model>.metadata.json)
    #[arg(long, conflicts_with = "batch")]
    pub metadata: Option<PathBuf>,

    /// Decrypt every *.encrypted file in the directory
    #[arg(long)]
    pub batch: bool,
}

/// Arguments for the `load` subcommand.
#[derive(Parser, Debug)]
pub struct LoadArgs {
    /// Encrypted model file
    #[arg(long)]
    pub model: PathBuf,

    /// Model format (default: guessed from the file name)
    #[arg(long)]
    pub format: Option<String>,
}

/// Arguments for the `info` subcommand.
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Encrypted model file
    #[arg(long)]
    pub model: PathBuf,
}

/// Arguments for the `probe` subcommand.
#[derive(Parser, Debug)]
pub struct ProbeArgs {
    /// Print the full report as JSON
    #[arg(long)]
    pub json: bool,

    /// Keep probing until ready or this many seconds have passed
    #[arg(long)]
    pub wait: Option<u64>,
}
