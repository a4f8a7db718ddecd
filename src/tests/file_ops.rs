use std::sync::Arc;

use crate::config::FileOpsConfig;
use crate::content::{FileContent, FileMetadata};
use crate::error::FileOpsError;
use crate::file_ops::{FileOps, ReadOptions, WriteOptions};

fn ops_with_limit(max_size: u64) -> FileOps {
    FileOps::new(FileOpsConfig {
        max_size,
        ..FileOpsConfig::default()
    })
}

#[tokio::test]
async fn should_accept_file_of_exactly_max_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.md");
    tokio::fs::write(&path, "12345678").await.unwrap();

    let ops = ops_with_limit(8);
    let (content, metadata) = ops.read(&path, &ReadOptions::default()).await.unwrap();
    assert_eq!(content.as_str(), "12345678");
    assert_eq!(metadata.size, 8);
}

#[tokio::test]
async fn should_reject_file_one_byte_over_max_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.md");
    tokio::fs::write(&path, "123456789").await.unwrap();

    let ops = ops_with_limit(8);
    let err = ops.read(&path, &ReadOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        FileOpsError::TooLarge {
            size: 9,
            max_size: 8,
            ..
        }
    ));
}

#[tokio::test]
async fn should_report_missing_file_as_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let ops = FileOps::new(FileOpsConfig::default());
    let err = ops
        .read(&dir.path().join("ghost.md"), &ReadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FileOpsError::NotFound { .. }));
}

#[tokio::test]
async fn should_reject_non_utf8_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.bin");
    tokio::fs::write(&path, [0xff, 0xfe, 0x00, 0x80]).await.unwrap();

    let ops = FileOps::new(FileOpsConfig::default());
    let err = ops.read(&path, &ReadOptions::default()).await.unwrap_err();
    assert!(matches!(err, FileOpsError::Decode { .. }));
}

#[tokio::test]
async fn should_apply_validation_predicate_on_read_and_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.md");
    tokio::fs::write(&path, "contains forbidden word").await.unwrap();

    let ops = FileOps::new(FileOpsConfig::default());
    let no_forbidden = Arc::new(|content: &FileContent| !content.as_str().contains("forbidden"));

    let err = ops
        .read(
            &path,
            &ReadOptions {
                validate: Some(no_forbidden.clone()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FileOpsError::Validation { .. }));

    let err = ops
        .write(
            &path,
            &FileContent::new("also forbidden"),
            &WriteOptions {
                validate: Some(no_forbidden.clone()),
                ..WriteOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FileOpsError::Validation { .. }));
    // A rejected write leaves the file untouched
    assert_eq!(
        tokio::fs::read_to_string(&path).await.unwrap(),
        "contains forbidden word"
    );

    // `validate` is the read-and-ask form
    assert!(!ops.validate(&path, no_forbidden).await.unwrap());
}

#[tokio::test]
async fn should_create_parent_directories_only_when_asked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/deeper/doc.md");
    let ops = FileOps::new(FileOpsConfig::default());

    let err = ops
        .write(&path, &FileContent::new("x"), &WriteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FileOpsError::NotFound { .. }));

    let bytes = ops
        .write(
            &path,
            &FileContent::new("x"),
            &WriteOptions {
                create_dirs: true,
                ..WriteOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(bytes, 1);
    assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "x");
}

#[tokio::test]
async fn should_stat_without_deriving_content_counts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.MD");
    tokio::fs::write(&path, "hello\nworld\n").await.unwrap();

    let ops = FileOps::new(FileOpsConfig::default());
    let stat = ops.stat(&path).await.unwrap();
    assert_eq!(stat.size, 12);
    assert!(stat.is_file);
    assert_eq!(stat.extension.as_deref(), Some("md"));
    assert!(stat.modified_ms > 0);
}

#[test]
fn should_derive_metadata_from_content() {
    let content = FileContent::new("héllo world\nsecond line\n");
    let metadata = FileMetadata::derive(&content, std::path::Path::new("/x/Doc.Md"), 42);
    assert_eq!(metadata.size, content.byte_len());
    // A trailing newline doesn't produce a phantom third line
    assert_eq!(metadata.line_count, 2);
    assert_eq!(metadata.word_count, 4);
    // Characters, not bytes: the accent is one character
    assert_eq!(metadata.char_count, 24);
    assert_eq!(metadata.modified_ms, 42);
    assert_eq!(metadata.extension.as_deref(), Some("md"));
}

#[test]
fn should_derive_empty_metadata_for_empty_content() {
    let content = FileContent::empty();
    let metadata = FileMetadata::derive(&content, std::path::Path::new("/x/doc"), 0);
    assert_eq!(metadata.line_count, 0);
    assert_eq!(metadata.word_count, 0);
    assert_eq!(metadata.char_count, 0);
    assert_eq!(metadata.extension, None);
}
