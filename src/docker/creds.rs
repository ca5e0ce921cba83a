//! Registry credential resolution.
//!
//! An ordered chain of loaders produces candidate credentials for a
//! registry; each candidate is verified with a push-permission probe
//! before use. Verified interactive credentials are persisted through a
//! `docker-credential-*` helper. Credentials never appear in logs.

use std::collections::HashMap;
use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::registry::{Reference, RegistryClient, RegistryError, RegistryOptions};

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredsError {
    #[error("credentials not found")]
    NotFound,
    #[error("registry rejected the credentials (unauthorized)")]
    Unauthorized,
    #[error("no credential helper configured")]
    HelperNotConfigured,
    #[error("credential helper '{0}' does not implement 'store'")]
    HelperWriteNotImplemented(String),
    #[error("credential helper '{name}' failed: {message}")]
    Helper { name: String, message: String },
    #[error("verifying credentials: {0}")]
    Verify(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Compare two registry addresses for credential-lookup purposes.
///
/// Hosts must match after Docker Hub aliasing (`*.docker.io` are all the
/// same registry); ports must match, or one side may omit a standard port
/// (80/443) the other states.
pub fn registry_equals(a: &str, b: &str) -> bool {
    let (host_a, port_a) = split_host_port(a);
    let (host_b, port_b) = split_host_port(b);
    if canonical_host(host_a) != canonical_host(host_b) {
        return false;
    }
    match (port_a, port_b) {
        (Some(a), Some(b)) => a == b,
        (None, None) => true,
        (Some(p), None) | (None, Some(p)) => p == "80" || p == "443",
    }
}

fn split_host_port(registry: &str) -> (&str, Option<&str>) {
    let registry = registry
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let registry = registry.split('/').next().unwrap_or(registry);
    match registry.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => (host, Some(port)),
        _ => (registry, None),
    }
}

fn canonical_host(host: &str) -> &str {
    if host == "docker.io" || host.ends_with(".docker.io") {
        "docker.io"
    } else {
        host
    }
}

// ---------------------------------------------------------------------------
// Engine auth configuration files

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AuthFile {
    #[serde(default)]
    pub auths: HashMap<String, AuthEntry>,
    #[serde(default, rename = "credHelpers", skip_serializing_if = "HashMap::is_empty")]
    pub cred_helpers: HashMap<String, String>,
    #[serde(default, rename = "credsStore", skip_serializing_if = "Option::is_none")]
    pub creds_store: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AuthEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl AuthEntry {
    pub fn credentials(&self) -> Option<Credentials> {
        if let (Some(u), Some(p)) = (&self.username, &self.password) {
            return Some(Credentials::new(u, p));
        }
        let auth = self.auth.as_deref()?;
        use base64::Engine as _;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth)
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some(Credentials::new(user, pass))
    }
}

impl AuthFile {
    pub fn read(path: &Path) -> Result<AuthFile, CredsError> {
        if !path.exists() {
            return Err(CredsError::NotFound);
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| CredsError::Other(anyhow::anyhow!("parsing {}: {e}", path.display())))
    }

    /// The auth entry whose key names the same registry.
    pub fn entry_for(&self, registry: &str) -> Option<&AuthEntry> {
        self.auths
            .iter()
            .find(|(key, _)| registry_equals(key, registry))
            .map(|(_, entry)| entry)
    }

    /// The helper configured for a registry, if any.
    pub fn helper_for(&self, registry: &str) -> Option<String> {
        self.cred_helpers
            .iter()
            .find(|(key, _)| registry_equals(key, registry))
            .map(|(_, helper)| helper.clone())
            .or_else(|| self.creds_store.clone())
    }
}

/// Candidate locations of the engine's auth file, most specific first.
pub fn engine_auth_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        paths.push(PathBuf::from(dir).join("config.json"));
    }
    if let Ok(file) = std::env::var("REGISTRY_AUTH_FILE") {
        paths.push(PathBuf::from(file));
    }
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        paths.push(PathBuf::from(dir).join("containers/auth.json"));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".docker/config.json"));
    }
    paths
}

/// This tool's own auth file.
pub fn own_auth_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fnforge/auth.json")
}

// ---------------------------------------------------------------------------
// Credential helpers (docker-credential-*)

#[derive(Debug, Serialize, Deserialize)]
struct HelperPayload {
    #[serde(rename = "ServerURL")]
    server_url: String,
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Run `docker-credential-<helper> get` for a registry.
pub fn helper_get(helper: &str, registry: &str) -> Result<Credentials, CredsError> {
    let output = run_helper(helper, "get", registry.as_bytes())?;
    if !output.status.success() {
        let text = String::from_utf8_lossy(&output.stdout).to_lowercase();
        let errtext = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if text.contains("credentials not found") || errtext.contains("credentials not found") {
            return Err(CredsError::NotFound);
        }
        return Err(CredsError::Helper {
            name: helper.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    #[derive(Deserialize)]
    struct Response {
        #[serde(rename = "Username", default)]
        username: String,
        #[serde(rename = "Secret", default)]
        secret: String,
    }
    let response: Response = serde_json::from_slice(&output.stdout).map_err(|e| {
        CredsError::Other(anyhow::anyhow!("parsing helper '{helper}' response: {e}"))
    })?;
    if response.username.is_empty() && response.secret.is_empty() {
        return Err(CredsError::NotFound);
    }
    Ok(Credentials::new(response.username, response.secret))
}

/// Run `docker-credential-<helper> store`. A helper advertising "not
/// implemented" is reported as such so callers can tolerate it.
pub fn helper_store(
    helper: &str,
    registry: &str,
    creds: &Credentials,
) -> Result<(), CredsError> {
    let payload = serde_json::to_vec(&HelperPayload {
        server_url: registry.to_string(),
        username: creds.username.clone(),
        secret: creds.password.clone(),
    })
    .expect("helper payload serializes");
    let output = run_helper(helper, "store", &payload)?;
    if output.status.success() {
        return Ok(());
    }
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
    .to_lowercase();
    if combined.contains("not implemented") {
        return Err(CredsError::HelperWriteNotImplemented(helper.to_string()));
    }
    Err(CredsError::Helper {
        name: helper.to_string(),
        message: combined.trim().to_string(),
    })
}

fn run_helper(helper: &str, action: &str, stdin: &[u8]) -> Result<std::process::Output, CredsError> {
    let binary = format!("docker-credential-{helper}");
    let mut child = std::process::Command::new(&binary)
        .arg(action)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| CredsError::Helper {
            name: helper.to_string(),
            message: format!("spawning {binary}: {e}"),
        })?;
    if let Some(mut pipe) = child.stdin.take() {
        pipe.write_all(stdin)?;
        pipe.write_all(b"\n")?;
    }
    Ok(child.wait_with_output()?)
}

/// List `docker-credential-*` helper names found on `PATH`.
pub fn list_credential_helpers() -> Vec<String> {
    let mut helpers = Vec::new();
    let Some(paths) = std::env::var_os("PATH") else {
        return helpers;
    };
    for dir in std::env::split_paths(&paths) {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(helper) = name.strip_prefix("docker-credential-") {
                if !helpers.iter().any(|h| h == helper) {
                    helpers.push(helper.to_string());
                }
            }
        }
    }
    helpers.sort();
    helpers
}

// ---------------------------------------------------------------------------
// Verification

/// Confirms a credential grants push access to the image's repository.
#[allow(async_fn_in_trait)]
pub trait CredentialVerifier {
    async fn verify(&self, image_ref: &str, creds: &Credentials) -> Result<(), CredsError>;
}

/// Default verifier: open (and abandon) a blob upload session against the
/// target repository. An optional address override bypasses DNS.
#[derive(Debug, Default)]
pub struct PushPermissionVerifier {
    pub insecure: bool,
    pub resolve: Option<(String, std::net::SocketAddr)>,
}

impl CredentialVerifier for PushPermissionVerifier {
    async fn verify(&self, image_ref: &str, creds: &Credentials) -> Result<(), CredsError> {
        let reference = Reference::parse(image_ref)
            .map_err(|e| CredsError::Verify(format!("parsing reference: {e}")))?;
        let client = RegistryClient::new(RegistryOptions {
            username: creds.username.clone(),
            password: creds.password.clone(),
            insecure: self.insecure,
            resolve: self.resolve.clone(),
        })
        .map_err(|e| CredsError::Verify(e.to_string()))?;
        match client.check_push_permission(&reference).await {
            Ok(()) => Ok(()),
            Err(RegistryError::Unauthorized) => Err(CredsError::Unauthorized),
            Err(e) => Err(CredsError::Verify(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// The chain

pub type Loader = Box<dyn Fn(&str) -> Result<Credentials, CredsError> + Send + Sync>;
pub type PromptFn = Box<dyn Fn(&str) -> Result<Credentials, CredsError> + Send + Sync>;
pub type ChooseHelperFn = Box<dyn Fn(&[String]) -> Result<Option<String>, CredsError> + Send + Sync>;

pub struct CredentialChain<V> {
    loaders: Vec<Loader>,
    verifier: V,
    prompt: Option<PromptFn>,
    choose_helper: Option<ChooseHelperFn>,
    own_auth_path: PathBuf,
}

impl<V: CredentialVerifier> CredentialChain<V> {
    /// The default loader order: this tool's auth file (honoring its
    /// configured helper), the engine's auth file, the engine's system
    /// credential store, and finally empty credentials for unsecured
    /// registries.
    pub fn with_default_loaders(verifier: V) -> Self {
        let own_path = own_auth_path();
        let own = own_path.clone();
        let loaders: Vec<Loader> = vec![
            Box::new(move |registry| {
                let file = AuthFile::read(&own)?;
                if let Some(creds) = file.entry_for(registry).and_then(AuthEntry::credentials) {
                    return Ok(creds);
                }
                match file.helper_for(registry) {
                    Some(helper) => helper_get(&helper, registry),
                    None => Err(CredsError::NotFound),
                }
            }),
            Box::new(|registry| {
                for path in engine_auth_paths() {
                    match AuthFile::read(&path) {
                        Ok(file) => {
                            if let Some(creds) =
                                file.entry_for(registry).and_then(AuthEntry::credentials)
                            {
                                return Ok(creds);
                            }
                        }
                        Err(CredsError::NotFound) => continue,
                        Err(e) => {
                            tracing::debug!(path = %path.display(), error = %e, "skipping auth file");
                        }
                    }
                }
                Err(CredsError::NotFound)
            }),
            Box::new(|registry| {
                for path in engine_auth_paths() {
                    if let Ok(file) = AuthFile::read(&path) {
                        if let Some(helper) = file.helper_for(registry) {
                            return helper_get(&helper, registry);
                        }
                    }
                }
                Err(CredsError::NotFound)
            }),
            // Unsecured registries: anonymous must get its chance to verify.
            Box::new(|_| Ok(Credentials::default())),
        ];
        CredentialChain {
            loaders,
            verifier,
            prompt: None,
            choose_helper: None,
            own_auth_path: own_path,
        }
    }

    pub fn with_loaders(verifier: V, loaders: Vec<Loader>) -> Self {
        CredentialChain {
            loaders,
            verifier,
            prompt: None,
            choose_helper: None,
            own_auth_path: own_auth_path(),
        }
    }

    pub fn prompt(mut self, prompt: PromptFn) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn choose_helper(mut self, choose: ChooseHelperFn) -> Self {
        self.choose_helper = Some(choose);
        self
    }

    pub fn own_auth_path(mut self, path: PathBuf) -> Self {
        self.own_auth_path = path;
        self
    }

    /// Resolve credentials for an image reference.
    ///
    /// Loaders run in order; "not found" and "unauthorized" advance the
    /// chain, any other verifier failure is fatal. When the chain is
    /// exhausted the interactive prompt loop runs, and credentials that
    /// verify are persisted through the configured helper.
    pub async fn resolve(&self, image_ref: &str) -> Result<Credentials, CredsError> {
        let reference = Reference::parse(image_ref)
            .map_err(|e| CredsError::Other(anyhow::anyhow!("parsing reference: {e}")))?;
        let registry = reference.registry.clone();

        for loader in &self.loaders {
            let creds = match loader(&registry) {
                Ok(creds) => creds,
                Err(CredsError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            match self.verifier.verify(image_ref, &creds).await {
                Ok(()) => return Ok(creds),
                Err(CredsError::Unauthorized) => continue,
                Err(e) => return Err(e),
            }
        }

        let Some(prompt) = &self.prompt else {
            return Err(CredsError::Unauthorized);
        };
        loop {
            let creds = prompt(&registry)?;
            match self.verifier.verify(image_ref, &creds).await {
                Ok(()) => {
                    self.persist(&registry, &creds);
                    return Ok(creds);
                }
                Err(CredsError::Unauthorized) => {
                    tracing::warn!(registry = %registry, "credentials rejected, try again");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persist verified credentials through the configured helper. A
    /// missing helper triggers a one-time selection; a helper without
    /// write support keeps the credential in memory only.
    fn persist(&self, registry: &str, creds: &Credentials) {
        let helper = match self.configured_helper(registry) {
            Some(helper) => helper,
            None => match self.select_and_record_helper() {
                Some(helper) => helper,
                None => {
                    tracing::debug!("no credential helper configured; not persisting");
                    return;
                }
            },
        };
        match helper_store(&helper, registry, creds) {
            Ok(()) => {}
            Err(CredsError::HelperWriteNotImplemented(name)) => {
                tracing::warn!(helper = %name, "helper does not persist credentials; keeping them for this run only");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to persist credentials");
            }
        }
    }

    fn configured_helper(&self, registry: &str) -> Option<String> {
        AuthFile::read(&self.own_auth_path)
            .ok()
            .and_then(|f| f.helper_for(registry))
    }

    fn select_and_record_helper(&self) -> Option<String> {
        let choose = self.choose_helper.as_ref()?;
        let available = list_credential_helpers();
        let helper = match choose(&available) {
            Ok(Some(helper)) => helper,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "helper selection failed");
                return None;
            }
        };
        let mut file = AuthFile::read(&self.own_auth_path).unwrap_or_default();
        file.creds_store = Some(helper.clone());
        if let Some(dir) = self.own_auth_path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        match serde_json::to_string_pretty(&file) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.own_auth_path, json) {
                    tracing::warn!(error = %e, "failed to record credential helper");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode auth config"),
        }
        Some(helper)
    }
}
