// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Change detection between the stored records and the last applied
//! server config.
//!
//! Digests cover the *inputs* of the artifact: every client record, and the
//! server interface, keypair and global settings records. Each half is a
//! `h1:` directory hash: the sorted list of `"<sha256 hex>  <name>\n"` lines
//! is itself hashed and the result base64-encoded.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use wgsync_types::ClientServerHashes;

use crate::store::{
    CLIENTS_DIR, GLOBAL_SETTINGS_FILE, INTERFACES_FILE, JsonStore, KEYPAIR_FILE, SERVER_DIR,
    StoreError,
};

/// Server records included in the server digest, in hashing order.
pub const SERVER_DIGEST_FILES: [&str; 3] = [GLOBAL_SETTINGS_FILE, INTERFACES_FILE, KEYPAIR_FILE];

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("failed to read {path} for hashing: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hash `(name, path)` pairs in the given order.
async fn hash_files(files: &[(String, PathBuf)]) -> Result<String, DigestError> {
    let mut summary = Sha256::new();
    for (name, path) in files {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|source| DigestError::Read {
                path: path.clone(),
                source,
            })?;
        let file_hash = Sha256::digest(&contents);
        summary.update(format!("{file_hash:x}  {name}\n").as_bytes());
    }
    Ok(format!("h1:{}", BASE64.encode(summary.finalize())))
}

fn entry_name(prefix: &str, path: &Path) -> String {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{prefix}/{file}")
}

/// Compute the digest pair for what is currently stored.
pub async fn current_digest(store: &JsonStore) -> Result<ClientServerHashes, DigestError> {
    let client_files: Vec<_> = store
        .client_record_files()
        .await?
        .into_iter()
        .map(|path| (entry_name(CLIENTS_DIR, &path), path))
        .collect();

    let server_dir = store.server_dir();
    let server_files: Vec<_> = SERVER_DIGEST_FILES
        .iter()
        .map(|file| (format!("{SERVER_DIR}/{file}"), server_dir.join(file)))
        .collect();

    let hashes = ClientServerHashes {
        client: hash_files(&client_files).await?,
        server: hash_files(&server_files).await?,
    };
    debug!(client = %hashes.client, server = %hashes.server, "computed digest");
    Ok(hashes)
}

/// Whether the stored records differ from the ones last committed.
pub async fn changed(store: &JsonStore) -> Result<bool, DigestError> {
    let stored = store.get_hashes().await?;
    let current = current_digest(store).await?;
    Ok(stored.client != current.client || stored.server != current.server)
}

/// Record the current digest as the applied state.
pub async fn commit(store: &JsonStore) -> Result<ClientServerHashes, DigestError> {
    let hashes = current_digest(store).await?;
    store.save_hashes(&hashes).await?;
    info!(client = %hashes.client, server = %hashes.server, "committed config digest");
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_set_has_stable_digest() {
        let a = hash_files(&[]).await.unwrap();
        let b = hash_files(&[]).await.unwrap();
        assert_eq!(a, b);
        // sha256 of the empty string, base64-encoded
        assert_eq!(a, "h1:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=");
    }

    #[tokio::test]
    async fn name_is_part_of_the_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json");
        tokio::fs::write(&path, b"{}").await.unwrap();

        let one = hash_files(&[("clients/a.json".into(), path.clone())]).await.unwrap();
        let two = hash_files(&[("clients/b.json".into(), path)]).await.unwrap();
        assert_ne!(one, two);
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = hash_files(&[("x".into(), dir.path().join("missing"))])
            .await
            .unwrap_err();
        assert!(matches!(err, DigestError::Read { .. }));
    }

    #[test]
    fn entry_name_uses_prefix() {
        assert_eq!(
            entry_name(CLIENTS_DIR, Path::new("/db/clients/abc.json")),
            "clients/abc.json"
        );
    }
}
