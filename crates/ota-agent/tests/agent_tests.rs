//! End-to-end tests: HTTP server, file-backed store and orchestrator together

use std::sync::Arc;

use anyhow::Result;
use ota_agent::config::default_partitions;
use ota_agent::{FileStore, HttpTransport};
use ota_test_helpers::prelude::*;
use ota_updater::prelude::*;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve(image: Vec<u8>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/app.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(image))
        .mount(&server)
        .await;
    server
}

fn orchestrator(store: &Arc<FileStore>, server: &MockServer) -> Result<UpdateOrchestrator> {
    let config = OtaConfig::with_url(format!("{}/app.bin", server.uri()));
    Ok(UpdateOrchestrator::new(
        store.clone(),
        Arc::new(HttpTransport::new()),
        config,
    )?)
}

fn seed_running(store: &FileStore, version: &str) -> Result<()> {
    let running = store.running_partition();
    std::fs::write(store.image_path(&running), ImageBuilder::new(version).payload(512).build())?;
    Ok(())
}

#[tokio::test]
async fn test_update_is_staged_and_committed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FileStore::open(dir.path(), default_partitions())?);
    seed_running(&store, "1.0.0")?;

    let image = ImageBuilder::new("1.1.0").payload(20_000).build();
    let server = serve(image.clone()).await;
    let mut orch = orchestrator(&store, &server)?;

    let report = orch.run_attempt().await?;
    orch.reboot().await;

    assert_eq!(report.version, "1.1.0");
    assert_eq!(report.previous_version.as_deref(), Some("1.0.0"));
    assert_eq!(report.bytes_written, image.len() as u64);
    assert_eq!(std::fs::read(store.image_path(&report.target))?, image);
    assert!(store.restart_requested());

    let relaunched = FileStore::open(dir.path(), default_partitions())?;
    assert_eq!(relaunched.running_partition().label, "ota_1");
    Ok(())
}

#[tokio::test]
async fn test_same_version_is_not_downloaded_into_flash() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FileStore::open(dir.path(), default_partitions())?);
    seed_running(&store, "1.0.0")?;

    let server = serve(ImageBuilder::new("1.0.0").payload(4_000).build()).await;
    let mut orch = orchestrator(&store, &server)?;

    let result = orch.run_attempt().await;

    assert!(matches!(result, Err(OtaError::NoNewerVersion { .. })));
    assert!(!dir.path().join("ota_1.bin").exists());
    assert!(!dir.path().join("ota_1.bin.part").exists());
    assert_eq!(store.otadata().boot, None);
    Ok(())
}

#[tokio::test]
async fn test_rolled_back_image_is_refused_after_relaunch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let bad = ImageBuilder::new("1.1.0").payload(2_000).build();
    let server = serve(bad).await;

    {
        let store = Arc::new(FileStore::open(dir.path(), default_partitions())?);
        seed_running(&store, "1.0.0")?;
        orchestrator(&store, &server)?.run_attempt().await?;
    }

    // the new image fails to boot; the bootloader falls back
    let relaunched = FileStore::open(dir.path(), default_partitions())?;
    let (invalid, boot) = relaunched.mark_boot_invalid().await?;
    assert_eq!(invalid.label, "ota_1");
    assert_eq!(boot.label, "ota_0");

    let store = Arc::new(FileStore::open(dir.path(), default_partitions())?);
    let mut orch = orchestrator(&store, &server)?;
    let result = orch.run_attempt().await;

    assert!(matches!(result, Err(OtaError::RollbackRejected { ref version }) if version == "1.1.0"));
    assert_eq!(store.configured_boot_partition().label, "ota_0");
    Ok(())
}

#[tokio::test]
async fn test_server_error_leaves_store_untouched() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FileStore::open(dir.path(), default_partitions())?);
    seed_running(&store, "1.0.0")?;

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let mut orch = orchestrator(&store, &server)?;

    let result = orch.run_attempt().await;

    assert!(matches!(
        result,
        Err(OtaError::Transport(TransportError::Status(503)))
    ));
    assert_eq!(orch.state(), UpdateState::Idle);
    assert!(!store.restart_requested());
    assert_eq!(store.otadata().boot, None);
    Ok(())
}

#[tokio::test]
async fn test_corrupt_image_is_not_committed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FileStore::open(dir.path(), default_partitions())?);
    seed_running(&store, "1.0.0")?;

    let corrupt = ImageBuilder::new("2.0.0").image_magic(0x00).payload(1_000).build();
    let server = serve(corrupt).await;
    let mut orch = orchestrator(&store, &server)?;

    let err = must_some(orch.run_attempt().await.err(), "corrupt image was accepted");

    assert_eq!(err.category(), ErrorCategory::MalformedImage);
    assert!(!dir.path().join("ota_1.bin").exists());
    assert_eq!(store.configured_boot_partition().label, "ota_0");
    Ok(())
}
