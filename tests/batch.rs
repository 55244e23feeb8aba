//! Batch encryption and decryption with per-item failure isolation.

use std::sync::Arc;

use a3s_vault::envelope::batch::{batch_decrypt, batch_encrypt, BatchStatus};
use a3s_vault::envelope::EnvelopeCryptoEngine;
use a3s_vault::tee::attestation::{EnvironmentKind, SimulatedAttestationService, TcbLevel};
use a3s_vault::tee::detect::StaticProbe;
use a3s_vault::tee::gate::KeyReleaseGate;
use a3s_vault::tee::policy::PolicyDocument;
use a3s_vault::test_utils::CountingCustodian;

fn engine_and_gate() -> (Arc<CountingCustodian>, EnvelopeCryptoEngine, KeyReleaseGate) {
    let custodian = Arc::new(CountingCustodian::new("batch-key"));
    let engine = EnvelopeCryptoEngine::new(custodian.clone());
    let gate = KeyReleaseGate::new(
        PolicyDocument::permissive(),
        Arc::new(SimulatedAttestationService::new(
            Default::default(),
            TcbLevel::UpToDate,
        )),
    )
    .with_custodian(custodian.clone());
    (custodian, engine, gate)
}

#[tokio::test]
async fn test_one_unreadable_file_does_not_abort_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let models = dir.path().join("models");
    std::fs::create_dir_all(&models).unwrap();
    std::fs::write(models.join("a.pt"), b"\x80model a").unwrap();
    std::fs::write(models.join("c.pt"), b"\x80model c").unwrap();
    // Dangling symlink: listed, but reading it fails even as root.
    #[cfg(unix)]
    std::os::unix::fs::symlink(dir.path().join("gone.pt"), models.join("b.pt")).unwrap();
    std::fs::write(models.join("notes.txt"), b"not a model").unwrap();

    let (custodian, engine, _) = engine_and_gate();
    let out = dir.path().join("encrypted");
    let summary = batch_encrypt(&engine, &models, &out, "*.pt", "batch-key")
        .await
        .unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.successful, 2);
    assert_eq!(summary.failed, 1);
    let failed = &summary.details[1];
    assert_eq!(failed.file, "b.pt");
    assert_eq!(failed.status, BatchStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("IO error"));
    assert_eq!(summary.details[2].file, "c.pt");
    assert_eq!(summary.details[2].status, BatchStatus::Success);

    assert!(out.join("a.pt.encrypted").exists());
    assert!(out.join("a.pt.encrypted.metadata.json").exists());
    assert!(!out.join("b.pt.encrypted").exists());
    assert_eq!(custodian.wrap_calls(), 2);
}

#[tokio::test]
async fn test_batch_decrypt_roundtrip_with_one_corrupt_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let models = dir.path().join("models");
    std::fs::create_dir_all(&models).unwrap();
    for name in ["x.onnx", "y.onnx", "z.onnx"] {
        std::fs::write(models.join(name), format!("weights of {name}")).unwrap();
    }

    let (custodian, engine, gate) = engine_and_gate();
    let encrypted = dir.path().join("encrypted");
    let summary = batch_encrypt(&engine, &models, &encrypted, "*.onnx", "batch-key")
        .await
        .unwrap();
    assert_eq!(summary.successful, 3);

    std::fs::remove_file(encrypted.join("y.onnx.encrypted.metadata.json")).unwrap();

    let verdict = gate
        .authorize(&StaticProbe::for_environment(EnvironmentKind::SevSnp))
        .await
        .unwrap();
    let restored = dir.path().join("restored");
    let summary = batch_decrypt(&engine, &gate, &verdict, &encrypted, &restored)
        .await
        .unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.successful, 2);
    assert_eq!(summary.failed, 1);
    assert!(summary.details[1].error.as_deref().unwrap().contains("Not found"));
    assert_eq!(
        std::fs::read(restored.join("x.onnx")).unwrap(),
        b"weights of x.onnx"
    );
    assert!(!restored.join("y.onnx").exists());
    assert_eq!(custodian.unwrap_calls(), 2);
}

#[tokio::test]
async fn test_batch_decrypt_with_rejected_verdict_releases_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let models = dir.path().join("models");
    std::fs::create_dir_all(&models).unwrap();
    std::fs::write(models.join("m.pt"), b"\x80m").unwrap();

    let (custodian, engine, gate) = engine_and_gate();
    let encrypted = dir.path().join("encrypted");
    batch_encrypt(&engine, &models, &encrypted, "*.pt", "batch-key")
        .await
        .unwrap();

    let verdict = gate.authorize(&StaticProbe::new()).await.unwrap();
    assert!(!verdict.trusted);
    let summary = batch_decrypt(&engine, &gate, &verdict, &encrypted, &dir.path().join("out"))
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert!(summary.details[0]
        .error
        .as_deref()
        .unwrap()
        .contains("Policy violation"));
    assert_eq!(custodian.unwrap_calls(), 0);
}
