//! Cluster API credentials: the in-cluster service account or a kubeconfig file.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("not running in a cluster: {0} is not set")]
    NotInCluster(&'static str),
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse kubeconfig: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("kubeconfig: {0}")]
    Invalid(String),
    #[error("decode {field}: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("TLS setup: {0}")]
    Tls(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
enum Token {
    Static(String),
    /// Re-read on every use; projected service account tokens rotate.
    File(PathBuf),
}

/// How to reach and authenticate against the cluster API.
#[derive(Debug, Clone)]
pub struct Credentials {
    server: String,
    token: Option<Token>,
    ca_pem: Option<Vec<u8>>,
    identity_pem: Option<Vec<u8>>,
    insecure: bool,
}

impl Credentials {
    /// Unauthenticated credentials for `server` (e.g. `https://10.0.0.1:443`).
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            token: None,
            ca_pem: None,
            identity_pem: None,
            insecure: false,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(Token::Static(token.into()));
        self
    }

    /// Credentials from a kubeconfig when given, the in-cluster service account otherwise.
    pub fn load(kubeconfig: Option<&Path>) -> Result<Self, CredentialsError> {
        match kubeconfig {
            Some(path) => Self::from_kubeconfig(path),
            None => Self::in_cluster(),
        }
    }

    /// Service account credentials mounted into every pod.
    pub fn in_cluster() -> Result<Self, CredentialsError> {
        Self::in_cluster_with(
            std::env::var("KUBERNETES_SERVICE_HOST").ok(),
            std::env::var("KUBERNETES_SERVICE_PORT").ok(),
            Path::new(SERVICE_ACCOUNT_DIR),
        )
    }

    fn in_cluster_with(
        host: Option<String>,
        port: Option<String>,
        account_dir: &Path,
    ) -> Result<Self, CredentialsError> {
        let host = host
            .filter(|h| !h.is_empty())
            .ok_or(CredentialsError::NotInCluster("KUBERNETES_SERVICE_HOST"))?;
        let port = port
            .filter(|p| !p.is_empty())
            .ok_or(CredentialsError::NotInCluster("KUBERNETES_SERVICE_PORT"))?;
        let server = if host.contains(':') {
            format!("https://[{host}]:{port}")
        } else {
            format!("https://{host}:{port}")
        };

        let token_path = account_dir.join("token");
        // Fail at startup rather than on the first subscription.
        read_file(&token_path)?;
        Ok(Self {
            server,
            token: Some(Token::File(token_path)),
            ca_pem: Some(read_file(&account_dir.join("ca.crt"))?),
            identity_pem: None,
            insecure: false,
        })
    }

    /// Credentials for the current context of a kubeconfig file.
    ///
    /// Supports bearer tokens, token files and client certificates. Exec and auth-provider
    /// plugins are not supported; such users connect anonymously.
    pub fn from_kubeconfig(path: &Path) -> Result<Self, CredentialsError> {
        let text = read_file(path)?;
        let config: Kubeconfig = serde_yaml::from_slice(&text)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let context_name = config
            .current_context
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CredentialsError::Invalid("no current-context".into()))?;
        let context = &config
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .ok_or_else(|| CredentialsError::Invalid(format!("context {context_name} not found")))?
            .context;
        let cluster = &config
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .ok_or_else(|| {
                CredentialsError::Invalid(format!("cluster {} not found", context.cluster))
            })?
            .cluster;
        let user = context
            .user
            .as_deref()
            .and_then(|name| config.users.iter().find(|u| u.name == name))
            .map(|u| &u.user);

        let ca_pem = load_pem(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
            base,
            "certificate-authority-data",
        )?;

        let mut token = None;
        let mut identity_pem = None;
        if let Some(user) = user {
            token = match (&user.token, &user.token_file) {
                (Some(t), _) if !t.is_empty() => Some(Token::Static(t.clone())),
                (_, Some(file)) => Some(Token::File(resolve(base, file))),
                _ => None,
            };
            let cert = load_pem(
                user.client_certificate_data.as_deref(),
                user.client_certificate.as_deref(),
                base,
                "client-certificate-data",
            )?;
            let key = load_pem(
                user.client_key_data.as_deref(),
                user.client_key.as_deref(),
                base,
                "client-key-data",
            )?;
            if let (Some(mut cert), Some(key)) = (cert, key) {
                cert.push(b'\n');
                cert.extend_from_slice(&key);
                identity_pem = Some(cert);
            }
        }

        Ok(Self {
            server: cluster.server.clone(),
            token,
            ca_pem,
            identity_pem,
            insecure: cluster.insecure_skip_tls_verify,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Current bearer token, read from disk for file-backed tokens.
    pub fn bearer_token(&self) -> Result<Option<String>, CredentialsError> {
        match &self.token {
            None => Ok(None),
            Some(Token::Static(t)) => Ok(Some(t.clone())),
            Some(Token::File(path)) => {
                let bytes = read_file(path)?;
                Ok(Some(String::from_utf8_lossy(&bytes).trim().to_string()))
            }
        }
    }

    /// HTTP client trusting the cluster CA and presenting the client certificate, if any.
    pub fn http_client(&self) -> Result<reqwest::Client, CredentialsError> {
        let mut builder = reqwest::Client::builder();
        if let Some(ca) = &self.ca_pem {
            for cert in reqwest::Certificate::from_pem_bundle(ca)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        if let Some(identity) = &self.identity_pem {
            builder = builder.identity(reqwest::Identity::from_pem(identity)?);
        }
        if self.insecure {
            tracing::warn!(server = %self.server, "TLS verification disabled for cluster API");
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(builder.build()?)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, CredentialsError> {
    std::fs::read(path).map_err(|source| CredentialsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Inline base64 data wins over a file reference.
fn load_pem(
    data: Option<&str>,
    file: Option<&Path>,
    base: &Path,
    field: &'static str,
) -> Result<Option<Vec<u8>>, CredentialsError> {
    if let Some(data) = data.filter(|d| !d.is_empty()) {
        let bytes = STANDARD
            .decode(data.trim())
            .map_err(|source| CredentialsError::Base64 { field, source })?;
        return Ok(Some(bytes));
    }
    match file {
        Some(file) => read_file(&resolve(base, file)).map(Some),
        None => Ok(None),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(default)]
    current_context: Option<String>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(default)]
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "tokenFile")]
    token_file: Option<PathBuf>,
    #[serde(default)]
    client_certificate: Option<PathBuf>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key: Option<PathBuf>,
    #[serde(default)]
    client_key_data: Option<String>,
}
