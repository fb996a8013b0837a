//! End-to-end file transfer scenarios over loopback TCP: the chunk path,
//! the desktop HTTP-download path and the mobile HTTP-upload path.

mod common;

use common::{pair, spawn_peer, wait_event};

use easyshare_core::device::Platform;
use easyshare_core::events::EasyShareEvent;
use easyshare_core::storage::{Storage, TransferDirection, TransferKind};
use tempfile::TempDir;

fn content_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Wait for a file completion event and return the saved path.
async fn wait_file_received(
    events: &mut easyshare_core::events::EventReceiver,
    expected_size: u64,
) -> std::path::PathBuf {
    wait_event(events, |event| match event {
        EasyShareEvent::TransferComplete(record)
            if record.direction == TransferDirection::Receive =>
        {
            match &record.kind {
                TransferKind::File {
                    file_size,
                    file_path: Some(path),
                    ..
                } if *file_size == expected_size => Some(path.clone()),
                _ => None,
            }
        }
        _ => None,
    })
    .await
}

#[tokio::test]
async fn small_file_chunk_transfer() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let mut a = spawn_peer("Alpha", Platform::Desktop, dir_a.path()).await;
    let mut b = spawn_peer("Beta", Platform::Desktop, dir_b.path()).await;

    pair(&mut a, &mut b, "7291").await;

    // 64 KiB * 4 + 1: five chunks, the last a single byte.
    let content = content_bytes(262_145);
    let source = dir_a.path().join("bundle.bin");
    tokio::fs::write(&source, &content).await.unwrap();

    assert!(a.handle.send_file(source).await, "send must resolve true");

    let saved_path = wait_file_received(&mut b.events, 262_145).await;
    let saved = tokio::fs::read(&saved_path).await.unwrap();
    assert_eq!(saved, content, "saved file must match byte-for-byte");

    let a_history = a.storage.transfers().unwrap();
    assert!(matches!(
        a_history[0].kind,
        TransferKind::File {
            file_size: 262_145,
            ..
        }
    ));
    let b_history = b.storage.transfers().unwrap();
    assert!(matches!(
        b_history[0].kind,
        TransferKind::File {
            file_size: 262_145,
            ..
        }
    ));
}

#[tokio::test]
async fn large_file_http_download() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    // Desktop sender serves the file; mobile receiver downloads it.
    let mut a = spawn_peer("Alpha", Platform::Desktop, dir_a.path()).await;
    let mut b = spawn_peer("Beta", Platform::Mobile, dir_b.path()).await;

    pair(&mut a, &mut b, "7291").await;

    let content = content_bytes(10 * 1024 * 1024);
    let source = dir_a.path().join("video.bin");
    tokio::fs::write(&source, &content).await.unwrap();

    assert!(a.handle.send_file(source).await, "ack=true resolves send");

    let saved_path = wait_file_received(&mut b.events, content.len() as u64).await;
    let saved = tokio::fs::read(&saved_path).await.unwrap();
    assert_eq!(saved.len(), content.len());
    assert_eq!(saved, content);

    // Both ends recorded a history entry.
    assert_eq!(a.storage.transfers().unwrap().len(), 1);
    assert_eq!(b.storage.transfers().unwrap().len(), 1);
}

#[tokio::test]
async fn large_file_http_upload_from_mobile() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    // Mobile sender cannot stream a digest; it uploads to the desktop's
    // endpoint and the desktop verifies by byte count.
    let mut a = spawn_peer("Alpha", Platform::Mobile, dir_a.path()).await;
    let mut b = spawn_peer("Beta", Platform::Desktop, dir_b.path()).await;

    pair(&mut a, &mut b, "7291").await;

    let content = content_bytes(10 * 1024 * 1024);
    let source = dir_a.path().join("camera.bin");
    tokio::fs::write(&source, &content).await.unwrap();

    assert!(a.handle.send_file(source).await);

    let saved_path = wait_file_received(&mut b.events, content.len() as u64).await;
    let saved = tokio::fs::read(&saved_path).await.unwrap();
    assert_eq!(saved, content);

    // No temp files left behind in the receive directory.
    let mut leftovers = tokio::fs::read_dir(dir_b.path()).await.unwrap();
    while let Some(entry) = leftovers.next_entry().await.unwrap() {
        let name = entry.file_name().to_string_lossy().to_string();
        assert!(
            !name.starts_with(".easyshare_tmp_"),
            "temp file {name} must not survive"
        );
    }
}

#[tokio::test]
async fn transfer_progress_is_reported() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let mut a = spawn_peer("Alpha", Platform::Desktop, dir_a.path()).await;
    let mut b = spawn_peer("Beta", Platform::Desktop, dir_b.path()).await;

    pair(&mut a, &mut b, "7291").await;

    let content = content_bytes(262_145);
    let source = dir_a.path().join("progress.bin");
    tokio::fs::write(&source, &content).await.unwrap();
    assert!(a.handle.send_file(source).await);

    // The sender reports per-chunk progress, ending at the full size.
    let final_bytes = wait_event(&mut a.events, |event| match event {
        EasyShareEvent::TransferProgress(Some(progress))
            if progress.bytes_transferred == 262_145 =>
        {
            Some(progress.total_bytes)
        }
        _ => None,
    })
    .await;
    assert_eq!(final_bytes, 262_145);

    // And clears the display when done.
    wait_event(&mut a.events, |event| match event {
        EasyShareEvent::TransferProgress(None) => Some(()),
        _ => None,
    })
    .await;
}
