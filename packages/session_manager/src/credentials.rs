//! Credential Materializer
//!
//! Launch environments may carry inline credential payloads under reserved
//! keys. Before the process starts they are written to a session-private
//! directory through the [`FileOpQueue`], and the reserved keys are removed
//! from the environment the child inherits.
//!
//! Layout: `<root>/<session id>/config.toml` and `<root>/<session id>/auth.json`.
//! The directory is never deleted here; it is handed back to the caller when
//! the session closes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::file_queue::{FileOpError, FileOpQueue};

/// Config file body; `{{session_dir}}` is replaced with the session directory
pub const ENV_CONFIG_BODY: &str = "SESSION_CONFIG_BODY";
/// Auth document (JSON)
pub const ENV_AUTH_DOCUMENT: &str = "SESSION_AUTH_DOCUMENT";
/// Secret spliced into the auth document
pub const ENV_AUTH_SECRET: &str = "SESSION_AUTH_SECRET";

pub const RESERVED_ENV_KEYS: &[&str] = &[ENV_CONFIG_BODY, ENV_AUTH_DOCUMENT, ENV_AUTH_SECRET];

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const AUTH_FILE_NAME: &str = "auth.json";
const SESSION_DIR_PLACEHOLDER: &str = "{{session_dir}}";

#[derive(Clone, Debug)]
pub struct CredentialSettings {
    /// Parent of all per-session directories
    pub root: PathBuf,
    /// JSON field of the auth document that receives the secret
    pub secret_field: String,
    /// Env var pointing the child at its session directory (None = don't set)
    pub home_env_var: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to materialize credentials in {}: {source}", dir.display())]
pub struct MaterializeError {
    pub dir: PathBuf,
    #[source]
    pub source: FileOpError,
}

/// Files written for one session instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterializedCredentials {
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

struct Payload {
    config_body: Option<String>,
    auth_document: Option<String>,
    auth_secret: Option<String>,
}

impl Payload {
    /// Remove every reserved key from `env`, keeping their values
    fn take_from(env: &mut BTreeMap<String, String>) -> Self {
        Self {
            config_body: env.remove(ENV_CONFIG_BODY),
            auth_document: env.remove(ENV_AUTH_DOCUMENT),
            auth_secret: env.remove(ENV_AUTH_SECRET),
        }
    }
}

pub struct CredentialMaterializer {
    queue: Arc<FileOpQueue>,
    settings: CredentialSettings,
}

impl CredentialMaterializer {
    pub fn new(queue: Arc<FileOpQueue>, settings: CredentialSettings) -> Self {
        Self { queue, settings }
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.settings.root.join(id)
    }

    /// Strip reserved keys from `env` and write any payloads they carried.
    ///
    /// Returns `None` when the environment held nothing to materialize.
    pub async fn materialize(
        &self,
        id: &str,
        env: &mut BTreeMap<String, String>,
    ) -> Result<Option<MaterializedCredentials>, MaterializeError> {
        let payload = Payload::take_from(env);

        if payload.config_body.is_none() && payload.auth_document.is_none() {
            if payload.auth_secret.is_some() {
                warn!("Session {}: auth secret supplied without an auth document, ignored", id);
            }
            return Ok(None);
        }

        let dir = self.session_dir(id);
        let fail = |source| MaterializeError {
            dir: dir.clone(),
            source,
        };

        let create = dir.clone();
        self.queue
            .run(format!("create {}", dir.display()), async move {
                tokio::fs::create_dir_all(create).await
            })
            .await
            .map_err(fail)?;

        let mut files = Vec::new();

        if let Some(body) = payload.config_body {
            let contents = body.replace(SESSION_DIR_PLACEHOLDER, &dir.to_string_lossy());
            files.push(self.write(&dir, CONFIG_FILE_NAME, contents).await.map_err(fail)?);
        }

        if let Some(document) = payload.auth_document {
            let contents = splice_secret(
                &document,
                &self.settings.secret_field,
                payload.auth_secret.as_deref(),
            );
            files.push(self.write(&dir, AUTH_FILE_NAME, contents).await.map_err(fail)?);
        }

        if let Some(var) = &self.settings.home_env_var {
            env.insert(var.clone(), dir.to_string_lossy().to_string());
        }

        info!(
            "Session {}: materialized {} credential file(s) in {}",
            id,
            files.len(),
            dir.display()
        );
        Ok(Some(MaterializedCredentials { dir, files }))
    }

    async fn write(&self, dir: &Path, name: &str, contents: String) -> Result<PathBuf, FileOpError> {
        let path = dir.join(name);
        let target = path.clone();
        self.queue
            .run(format!("write {}", path.display()), async move {
                tokio::fs::write(target, contents).await
            })
            .await?;
        debug!("Wrote {}", path.display());
        Ok(path)
    }
}

/// Replace `field` in a JSON object document with `secret`.
///
/// Falls back to the unmodified document when it is not a JSON object.
pub fn splice_secret(document: &str, field: &str, secret: Option<&str>) -> String {
    let Some(secret) = secret else {
        return document.to_string();
    };

    match serde_json::from_str::<serde_json::Value>(document) {
        Ok(serde_json::Value::Object(mut map)) => {
            map.insert(field.to_string(), serde_json::Value::String(secret.to_string()));
            serde_json::to_string_pretty(&serde_json::Value::Object(map))
                .unwrap_or_else(|_| document.to_string())
        }
        Ok(_) => {
            warn!("Auth document is not a JSON object, writing it unmodified");
            document.to_string()
        }
        Err(e) => {
            warn!("Auth document is not valid JSON ({}), writing it unmodified", e);
            document.to_string()
        }
    }
}
