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

//! Record store: one pretty-printed JSON document per record under a root
//! directory.
//!
//! ```text
//! <root>/server/interfaces.json
//! <root>/server/keypair.json
//! <root>/server/global_settings.json
//! <root>/server/hashes.json
//! <root>/clients/<id>.json
//! <root>/users/<username>.json
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use wgsync_types::{
    Client, ClientServerHashes, GlobalSetting, Server, ServerInterface, ServerKeypair, User,
};

use crate::keys;

pub const SERVER_DIR: &str = "server";
pub const CLIENTS_DIR: &str = "clients";
pub const USERS_DIR: &str = "users";

pub const INTERFACES_FILE: &str = "interfaces.json";
pub const KEYPAIR_FILE: &str = "keypair.json";
pub const GLOBAL_SETTINGS_FILE: &str = "global_settings.json";
pub const HASHES_FILE: &str = "hashes.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid record {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("invalid username: {0:?}")]
    InvalidUsername(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn server_dir(&self) -> PathBuf {
        self.root.join(SERVER_DIR)
    }

    pub fn clients_dir(&self) -> PathBuf {
        self.root.join(CLIENTS_DIR)
    }

    pub fn users_dir(&self) -> PathBuf {
        self.root.join(USERS_DIR)
    }

    fn server_file(&self, name: &str) -> PathBuf {
        self.server_dir().join(name)
    }

    fn client_file(&self, id: &str) -> Result<PathBuf> {
        if !is_record_name(id) {
            return Err(StoreError::ClientNotFound(id.to_string()));
        }
        Ok(self.clients_dir().join(format!("{id}.json")))
    }

    fn user_file(&self, username: &str) -> Result<PathBuf> {
        if !is_record_name(username) {
            return Err(StoreError::InvalidUsername(username.to_string()));
        }
        Ok(self.users_dir().join(format!("{username}.json")))
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Create the directory layout and any missing server record. Records
    /// that already exist are left alone.
    #[tracing::instrument(skip_all, fields(root = %self.root.display()))]
    pub async fn init(&self, interface: &ServerInterface, settings: &GlobalSetting) -> Result<()> {
        for dir in [self.server_dir(), self.clients_dir(), self.users_dir()] {
            tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
        }

        if !self.exists(INTERFACES_FILE).await? {
            info!(addresses = ?interface.addresses, "creating default server interface");
            self.save_server_interface(interface).await?;
        }

        if !self.exists(KEYPAIR_FILE).await? {
            info!("generating server keypair");
            let pair = keys::generate_keypair();
            self.save_server_keypair(&ServerKeypair {
                private_key: pair.private_key,
                public_key: pair.public_key,
                updated_at: Utc::now(),
            })
            .await?;
        }

        if !self.exists(GLOBAL_SETTINGS_FILE).await? {
            info!(path = %settings.config_file_path, "creating default global settings");
            self.save_global_settings(settings).await?;
        }

        if !self.exists(HASHES_FILE).await? {
            self.save_hashes(&ClientServerHashes::unset()).await?;
        }

        Ok(())
    }

    async fn exists(&self, server_file: &str) -> Result<bool> {
        let path = self.server_file(server_file);
        tokio::fs::try_exists(&path).await.map_err(io_err(&path))
    }

    // -- Reads --------------------------------------------------------------

    pub async fn get_server(&self) -> Result<Server> {
        let interface = read_json(&self.server_file(INTERFACES_FILE)).await?;
        let keypair = read_json(&self.server_file(KEYPAIR_FILE)).await?;
        Ok(Server { keypair, interface })
    }

    pub async fn get_global_settings(&self) -> Result<GlobalSetting> {
        read_json(&self.server_file(GLOBAL_SETTINGS_FILE)).await
    }

    pub async fn get_hashes(&self) -> Result<ClientServerHashes> {
        read_json(&self.server_file(HASHES_FILE)).await
    }

    /// Client record files, sorted by file name.
    pub async fn client_record_files(&self) -> Result<Vec<PathBuf>> {
        json_files(&self.clients_dir()).await
    }

    pub async fn get_clients(&self) -> Result<Vec<Client>> {
        let mut clients = Vec::new();
        for path in self.client_record_files().await? {
            clients.push(read_json(&path).await?);
        }
        debug!(count = clients.len(), "loaded clients");
        Ok(clients)
    }

    pub async fn get_client(&self, id: &str) -> Result<Client> {
        let path = self.client_file(id)?;
        match read_json(&path).await {
            Err(StoreError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Err(StoreError::ClientNotFound(id.to_string()))
            }
            other => other,
        }
    }

    pub async fn get_users(&self) -> Result<Vec<User>> {
        let mut users = Vec::new();
        for path in json_files(&self.users_dir()).await? {
            users.push(read_json(&path).await?);
        }
        Ok(users)
    }

    // -- Writes -------------------------------------------------------------

    #[tracing::instrument(skip_all, fields(client_id = %client.id))]
    pub async fn save_client(&self, client: &Client) -> Result<()> {
        write_json(&self.client_file(&client.id)?, client).await?;
        debug!(name = %client.name, "saved client");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_client(&self, id: &str) -> Result<()> {
        let path = self.client_file(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("deleted client");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::ClientNotFound(id.to_string()))
            }
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    pub async fn save_server_interface(&self, interface: &ServerInterface) -> Result<()> {
        write_json(&self.server_file(INTERFACES_FILE), interface).await
    }

    pub async fn save_server_keypair(&self, keypair: &ServerKeypair) -> Result<()> {
        write_json(&self.server_file(KEYPAIR_FILE), keypair).await
    }

    pub async fn save_global_settings(&self, settings: &GlobalSetting) -> Result<()> {
        write_json(&self.server_file(GLOBAL_SETTINGS_FILE), settings).await
    }

    pub async fn save_hashes(&self, hashes: &ClientServerHashes) -> Result<()> {
        write_json(&self.server_file(HASHES_FILE), hashes).await
    }

    pub async fn save_user(&self, user: &User) -> Result<()> {
        write_json(&self.user_file(&user.username)?, user).await
    }
}

// -- Helpers ----------------------------------------------------------------

/// Record names end up in a path; refuse anything that could leave its
/// directory.
fn is_record_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\'])
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await.map_err(io_err(path))?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
    }

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &contents).await.map_err(io_err(&tmp))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_err(&tmp))?;
    }

    tokio::fs::rename(&tmp, path).await.map_err(io_err(path))
}

async fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir)(e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err(dir))? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
