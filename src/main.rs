use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use a3s_vault::cli::{Cli, Command, DecryptArgs, EncryptArgs, InfoArgs, LoadArgs, ProbeArgs};
use a3s_vault::clients::Collaborators;
use a3s_vault::config::VaultConfig;
use a3s_vault::envelope::batch;
use a3s_vault::model::format::ModelFormat;
use a3s_vault::model::materializer::read_model_info;

const PROBE_RETRY_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match cli.config {
        Some(ref path) => VaultConfig::load_from(path)?,
        None => VaultConfig::load()?,
    };
    let collaborators = Collaborators::new(config);

    match cli.command {
        Command::Encrypt(args) => run_encrypt(&collaborators, args).await?,
        Command::Decrypt(args) => run_decrypt(&collaborators, args).await?,
        Command::Load(args) => run_load(&collaborators, args).await?,
        Command::Info(args) => run_info(args)?,
        Command::Attest => run_attest(&collaborators).await?,
        Command::Probe(args) => {
            let code = run_probe(&collaborators, args).await?;
            std::process::exit(code);
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run_encrypt(collaborators: &Collaborators, args: EncryptArgs) -> anyhow::Result<()> {
    collaborators.config().validate()?;
    let engine = collaborators.engine().await?;
    let key_ref = args
        .key_ref
        .unwrap_or_else(|| collaborators.config().custodian.key_ref.clone());

    if args.batch {
        let summary =
            batch::batch_encrypt(&engine, &args.model, &args.output, &args.pattern, &key_ref)
                .await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        if summary.failed > 0 {
            anyhow::bail!("{} of {} files failed to encrypt", summary.failed, summary.total);
        }
        return Ok(());
    }

    let metadata = engine
        .encrypt_file(&args.model, &args.output, args.metadata.as_deref(), &key_ref)
        .await?;
    println!("Encrypted: {}", args.output.display());
    println!("Artifact: {}", metadata.artifact_name);
    println!("Plaintext size: {}", format_bytes(metadata.plaintext_length));
    println!("SHA256: {}", metadata.plaintext_digest);
    Ok(())
}

async fn run_decrypt(collaborators: &Collaborators, args: DecryptArgs) -> anyhow::Result<()> {
    collaborators.config().validate()?;
    let engine = collaborators.engine().await?;
    let gate = collaborators.gate().await?;
    let verdict = gate.authorize(collaborators.probe().as_ref()).await?;
    if !verdict.trusted {
        anyhow::bail!(
            "Attestation rejected ({}): {}",
            verdict.environment_kind,
            verdict.failures.join("; ")
        );
    }

    if args.batch {
        let summary = batch::batch_decrypt(
            &engine,
            &gate,
            &verdict,
            &args.encrypted_model,
            &args.output,
        )
        .await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        if summary.failed > 0 {
            anyhow::bail!("{} of {} files failed to decrypt", summary.failed, summary.total);
        }
        return Ok(());
    }

    let metadata = engine
        .decrypt_file(
            &args.encrypted_model,
            &args.output,
            args.metadata.as_deref(),
            &gate,
            &verdict,
        )
        .await?;
    println!("Decrypted: {}", args.output.display());
    println!("Artifact: {}", metadata.artifact_name);
    println!("Size: {}", format_bytes(metadata.plaintext_length));
    Ok(())
}

async fn run_load(collaborators: &Collaborators, args: LoadArgs) -> anyhow::Result<()> {
    collaborators.config().validate()?;
    let format = match args.format {
        Some(ref name) => name.parse::<ModelFormat>()?,
        None => ModelFormat::from_path(&args.model).unwrap_or(ModelFormat::Raw),
    };
    let materializer = collaborators.materializer().await?;

    let result = materializer.materialize(&args.model, format).await;
    let loaded = materializer.loaded();
    let released = materializer.cleanup()?;
    let handle = result?;

    for model in &loaded {
        println!("Loaded: {}", model.artifact_name);
        println!("Format: {}", model.format);
        println!("Size: {}", format_bytes(model.plaintext_length));
        println!("Cache key: {}", model.cache_key);
    }
    println!("In-memory bytes: {}", handle.len());
    println!("Released {released} cached model(s); scratch erased");
    Ok(())
}

fn run_info(args: InfoArgs) -> anyhow::Result<()> {
    let info = read_model_info(&args.model)?;
    println!("Artifact: {}", info.artifact_name);
    println!("Path: {}", info.path.display());
    println!("Metadata: {}", info.metadata_path.display());
    println!("Algorithm: {}", info.algorithm);
    println!("Custodian key: {}", info.custodian_key_ref);
    println!("Plaintext size: {}", format_bytes(info.plaintext_length));
    println!("Ciphertext size: {}", format_bytes(info.ciphertext_length));
    println!("SHA256: {}", info.plaintext_digest);
    if let Some(created) = info.created_at {
        println!("Created: {}", created.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}

async fn run_attest(collaborators: &Collaborators) -> anyhow::Result<()> {
    let gate = collaborators.gate().await?;
    let verdict = gate.authorize(collaborators.probe().as_ref()).await?;
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    if !verdict.trusted {
        anyhow::bail!("Attestation verdict rejected");
    }
    Ok(())
}

async fn run_probe(collaborators: &Collaborators, args: ProbeArgs) -> anyhow::Result<i32> {
    let aggregator = collaborators.readiness().await;
    let deadline = args
        .wait
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

    let report = loop {
        let report = aggregator.run().await;
        match deadline {
            Some(deadline) if !report.ready && tokio::time::Instant::now() < deadline => {
                tracing::info!("Not ready yet, retrying");
                tokio::time::sleep(PROBE_RETRY_INTERVAL).await;
            }
            _ => break report,
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for check in &report.checks {
            println!(
                "{:<12} {:<5} {:>6}ms  {}",
                check.name,
                check.outcome.to_string(),
                check.duration_ms,
                check.detail
            );
        }
        println!("{}", if report.ready { "READY" } else { "NOT READY" });
    }
    Ok(report.exit_code())
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
