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

//! Server-side configuration artifact.
//!
//! The artifact is rendered from a handlebars template, either the built-in
//! one or an operator-supplied file, against the server, every client, every
//! user and the global settings. Templates get a `join` helper that
//! concatenates any number of string arrays with commas (or `sep="..."`),
//! skipping empty entries.

use std::path::{Path, PathBuf};

use handlebars::{
    Context, Handlebars, Helper, HelperResult, Output, RenderContext, no_escape,
};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use wgsync_types::{Client, GlobalSetting, Server, User};

pub const DEFAULT_TEMPLATE: &str = include_str!("../templates/wg.conf.hbs");

const TEMPLATE_NAME: &str = "wg_config";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to read template {path}: {source}")]
    TemplateRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse template: {0}")]
    TemplateParse(#[from] handlebars::TemplateError),

    #[error("failed to render template: {0}")]
    TemplateRender(#[from] handlebars::RenderError),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl RenderError {
    /// Whether the template itself is at fault, as opposed to the filesystem.
    pub fn is_template(&self) -> bool {
        matches!(self, Self::TemplateParse(_) | Self::TemplateRender(_))
    }
}

#[derive(Debug, Serialize)]
struct TemplateContext<'a> {
    server: &'a Server,
    clients: Vec<Client>,
    users: &'a [User],
    settings: &'a GlobalSetting,
}

/// Turn embedded newlines into commented continuation lines so a multi-line
/// note cannot break out of its comment block.
pub fn escape_notes(notes: &str) -> String {
    notes.replace("\r\n", "\n").replace('\n', "\n# ")
}

fn join_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let sep = h
        .hash_get("sep")
        .and_then(|v| v.value().as_str())
        .unwrap_or(",");

    let items: Vec<&str> = h
        .params()
        .iter()
        .filter_map(|p| p.value().as_array())
        .flatten()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    out.write(&items.join(sep))?;
    Ok(())
}

fn registry(template: &str) -> Result<Handlebars<'static>, RenderError> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(false);
    handlebars.register_escape_fn(no_escape);
    handlebars.register_helper("join", Box::new(join_helper));
    handlebars.register_template_string(TEMPLATE_NAME, template)?;
    Ok(handlebars)
}

fn context<'a>(
    server: &'a Server,
    clients: &[Client],
    users: &'a [User],
    settings: &'a GlobalSetting,
) -> TemplateContext<'a> {
    let clients = clients
        .iter()
        .cloned()
        .map(|mut c| {
            c.additional_notes = escape_notes(&c.additional_notes);
            c
        })
        .collect();

    TemplateContext {
        server,
        clients,
        users,
        settings,
    }
}

/// Render `template` in memory.
pub fn render(
    template: &str,
    server: &Server,
    clients: &[Client],
    users: &[User],
    settings: &GlobalSetting,
) -> Result<String, RenderError> {
    let handlebars = registry(template)?;
    let ctx = context(server, clients, users, settings);
    Ok(handlebars.render(TEMPLATE_NAME, &ctx)?)
}

/// Load the override template if one is configured, else the built-in one.
pub async fn load_template(path: Option<&Path>) -> Result<String, RenderError> {
    match path {
        Some(path) => {
            debug!(path = %path.display(), "reading custom template");
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| RenderError::TemplateRead {
                    path: path.to_path_buf(),
                    source,
                })
        }
        None => Ok(DEFAULT_TEMPLATE.to_string()),
    }
}

/// Render the artifact and write it to `settings.config_file_path`.
///
/// The target is truncated in place before rendering; a render failure
/// leaves it empty and is reported to the caller. Writing again once the
/// cause is fixed is safe.
#[tracing::instrument(skip_all, fields(path = %settings.config_file_path))]
pub async fn write(
    template_path: Option<&Path>,
    server: &Server,
    clients: &[Client],
    users: &[User],
    settings: &GlobalSetting,
) -> Result<(), RenderError> {
    let template = load_template(template_path).await?;
    let handlebars = registry(&template)?;

    let path = PathBuf::from(&settings.config_file_path);
    let write_err = |source| RenderError::Write {
        path: path.clone(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let mut file = tokio::fs::File::create(&path).await.map_err(write_err)?;

    let ctx = context(server, clients, users, settings);
    let rendered = handlebars.render(TEMPLATE_NAME, &ctx)?;

    file.write_all(rendered.as_bytes()).await.map_err(write_err)?;
    file.flush().await.map_err(write_err)?;

    info!(
        peer_count = clients.iter().filter(|c| c.enabled).count(),
        bytes = rendered.len(),
        "wrote server config"
    );
    Ok(())
}
