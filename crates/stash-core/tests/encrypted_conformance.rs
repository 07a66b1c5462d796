//! The encryption decorator must satisfy the same contract as the backend
//! it wraps.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use stash_core::EncryptedBackend;
use stash_core::crypto::{EncryptionKey, KeySize};
use stash_storage::testing::{buffered_suite, removable_suite};
use stash_storage::{Backend, MemoryBackend, RemovableBackend, SqliteBackend, SqliteConfig};

#[tokio::test]
async fn encrypted_memory_backend_conforms() {
    for size in KeySize::ALL {
        let backend = EncryptedBackend::new(MemoryBackend::new(), EncryptionKey::generate(size));
        buffered_suite(&backend).await;
        removable_suite(&backend).await;
    }
}

#[tokio::test]
async fn encrypted_sqlite_backend_conforms() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("encrypted.db");
    let sqlite = SqliteBackend::connect(SqliteConfig::new(path.display().to_string()))
        .await
        .unwrap();
    let backend = EncryptedBackend::new(sqlite, EncryptionKey::generate(KeySize::Aes128));
    buffered_suite(&backend).await;
    removable_suite(&backend).await;
    backend.close().await.unwrap();
}

#[tokio::test]
async fn decorators_stack_over_shared_backends() {
    let shared: Arc<dyn RemovableBackend> = Arc::new(MemoryBackend::new());
    let outer = EncryptedBackend::new(
        EncryptedBackend::new(Arc::clone(&shared), EncryptionKey::generate(KeySize::Aes256)),
        EncryptionKey::generate(KeySize::Aes192),
    );

    outer.save("layered", b"payload").await.unwrap();
    assert_eq!(outer.retrieve("layered").await.unwrap(), b"payload");
    assert_ne!(shared.retrieve("layered").await.unwrap(), b"payload");
    removable_suite(&outer).await;
}
