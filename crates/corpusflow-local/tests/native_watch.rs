use std::fs;
use std::time::Duration;

use anyhow::Result;
use corpusflow_core::{CacheConfig, Credentials, DocumentSource, WatchAction, WatchEvent};
use corpusflow_local::{LocalFileSystemSource, LocalSourceConfig};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::assert_ok;

/// Wait for the first event matching `action` and `name`, skipping others.
async fn expect_event(
    rx: &mut UnboundedReceiver<WatchEvent>,
    action: WatchAction,
    name: &str,
) -> Result<WatchEvent> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("watch ended before {} {}", action, name))?;
        if event.action == action && event.metadata.name == name {
            return Ok(event);
        }
    }
}

async fn connected_source(dir: &TempDir) -> Result<LocalFileSystemSource> {
    let config = LocalSourceConfig::new(dir.path()).with_cache(CacheConfig::Memory);
    let source = LocalFileSystemSource::open(config).await?;
    assert!(source.connect(&Credentials::new()).await?);
    Ok(source)
}

#[tokio::test]
async fn test_native_watch_reports_created_files() -> Result<()> {
    let dir = TempDir::new()?;
    let source = connected_source(&dir).await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    assert!(source.watch_documents(tx, None).await?);

    fs::write(dir.path().join("new.txt"), b"hello")?;
    fs::write(dir.path().join("ignored.png"), b"png")?;

    let event = expect_event(&mut rx, WatchAction::Created, "new.txt").await?;
    assert_eq!(event.metadata.source, "local");

    let cached = source.list_documents(None).await?;
    assert!(cached.iter().any(|m| m.name == "new.txt"));
    assert!(cached.iter().all(|m| m.name != "ignored.png"));

    assert_ok!(source.stop_watching().await);
    Ok(())
}

#[tokio::test]
async fn test_native_watch_reports_removed_directory_contents() -> Result<()> {
    let dir = TempDir::new()?;
    fs::create_dir(dir.path().join("reports"))?;
    fs::write(dir.path().join("reports/q1.pdf"), b"%PDF")?;
    fs::write(dir.path().join("top.txt"), b"t")?;

    let source = connected_source(&dir).await?;
    assert_eq!(source.list_documents(None).await?.len(), 2);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    source.watch_documents(tx, None).await?;

    fs::remove_dir_all(dir.path().join("reports"))?;

    let event = expect_event(&mut rx, WatchAction::Deleted, "q1.pdf").await?;
    assert!(event.metadata.doc_id.ends_with("q1.pdf"));

    let remaining: Vec<String> = source
        .list_documents(None)
        .await?
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(remaining, vec!["top.txt"]);

    source.stop_watching().await?;
    Ok(())
}

#[tokio::test]
async fn test_native_watch_reports_moved_in_directory_contents() -> Result<()> {
    let outer = TempDir::new()?;
    let root = outer.path().join("root");
    let staging = outer.path().join("staging");
    fs::create_dir(&root)?;
    fs::create_dir_all(staging.join("nested"))?;
    fs::write(staging.join("inside.pdf"), b"%PDF")?;
    fs::write(staging.join("nested/deep.txt"), b"deep")?;
    fs::write(staging.join("skip.png"), b"png")?;

    let config = LocalSourceConfig::new(&root).with_cache(CacheConfig::Memory);
    let source = LocalFileSystemSource::open(config).await?;
    assert!(source.connect(&Credentials::new()).await?);
    assert!(source.list_documents(None).await?.is_empty());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    source.watch_documents(tx, None).await?;

    // A rename within one filesystem raises no events for the contents.
    fs::rename(&staging, root.join("moved"))?;

    let inside = expect_event(&mut rx, WatchAction::Created, "inside.pdf").await?;
    assert!(inside.metadata.doc_id.ends_with("moved/inside.pdf"));
    expect_event(&mut rx, WatchAction::Created, "deep.txt").await?;

    let mut names: Vec<String> = source
        .list_documents(None)
        .await?
        .into_iter()
        .map(|m| m.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["deep.txt", "inside.pdf"]);

    source.stop_watching().await?;
    Ok(())
}

#[tokio::test]
async fn test_second_watch_call_is_a_no_op() -> Result<()> {
    let dir = TempDir::new()?;
    let source = connected_source(&dir).await?;

    let (first_tx, mut first_rx) = tokio::sync::mpsc::unbounded_channel();
    let (second_tx, mut second_rx) = tokio::sync::mpsc::unbounded_channel();
    assert!(source.watch_documents(first_tx, None).await?);
    assert!(source.watch_documents(second_tx, None).await?);

    // The ignored sink is dropped right away.
    assert!(second_rx.recv().await.is_none());

    fs::write(dir.path().join("only.docx"), b"PK")?;
    expect_event(&mut first_rx, WatchAction::Created, "only.docx").await?;

    assert!(source.stop_watching().await?);
    assert!(!source.is_watching().await);
    Ok(())
}
