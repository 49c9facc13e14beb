use std::path::PathBuf;

use tracing::{debug, warn};

/// libgit2 asks again after every rejected credential; stop after this many.
const MAX_AUTH_ATTEMPTS: usize = 3;

/// How to authenticate against the remote.
#[derive(Debug, Clone, Default)]
pub enum Credentials {
    /// Private key file, optionally passphrase-protected.
    SshKey {
        username: String,
        private_key: PathBuf,
        passphrase: Option<String>,
    },
    /// Keys held by the running ssh-agent (`SSH_AUTH_SOCK`).
    SshAgent { username: String },
    /// Git credential helpers, then libgit2 defaults.
    #[default]
    Default,
}

impl Credentials {
    /// Pick a credential from configuration: an explicit key wins, an empty
    /// key path falls back to the ssh-agent.
    pub fn from_ssh(username: &str, key_path: &str, passphrase: &str) -> Self {
        let username = if username.trim().is_empty() {
            "git".to_string()
        } else {
            username.to_string()
        };
        if key_path.trim().is_empty() {
            return Credentials::SshAgent { username };
        }
        Credentials::SshKey {
            username,
            private_key: PathBuf::from(key_path),
            passphrase: (!passphrase.is_empty()).then(|| passphrase.to_string()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Credentials::SshKey { private_key, .. } => {
                format!("ssh key {}", private_key.display())
            }
            Credentials::SshAgent { .. } => "ssh-agent".to_string(),
            Credentials::Default => "default".to_string(),
        }
    }

    /// Remote callbacks answering credential requests with `self`.
    pub(crate) fn remote_callbacks<'a>(&self) -> git2::RemoteCallbacks<'a> {
        let credentials = self.clone();
        let mut attempts = 0usize;
        let mut callbacks = git2::RemoteCallbacks::new();
        callbacks.credentials(move |url, username_from_url, allowed| {
            attempts += 1;
            if attempts > MAX_AUTH_ATTEMPTS {
                warn!(url, attempts, "giving up on remote authentication");
                return Err(git2::Error::from_str("remote authentication failed"));
            }
            debug!(url, method = %credentials.describe(), "remote requested credentials");
            credentials.resolve(url, username_from_url, allowed)
        });
        callbacks
    }

    fn resolve(
        &self,
        url: &str,
        username_from_url: Option<&str>,
        allowed: git2::CredentialType,
    ) -> Result<git2::Cred, git2::Error> {
        if allowed.contains(git2::CredentialType::USERNAME) {
            let user = match self {
                Credentials::SshKey { username, .. } | Credentials::SshAgent { username } => {
                    username.as_str()
                }
                Credentials::Default => username_from_url.unwrap_or("git"),
            };
            return git2::Cred::username(user);
        }

        match self {
            Credentials::SshKey {
                username,
                private_key,
                passphrase,
            } => git2::Cred::ssh_key(
                username_from_url.unwrap_or(username),
                None,
                private_key,
                passphrase.as_deref(),
            ),
            Credentials::SshAgent { username } => {
                git2::Cred::ssh_key_from_agent(username_from_url.unwrap_or(username))
            }
            Credentials::Default => {
                if allowed.contains(git2::CredentialType::USER_PASS_PLAINTEXT) {
                    if let Ok(config) = git2::Config::open_default() {
                        return git2::Cred::credential_helper(&config, url, username_from_url);
                    }
                }
                git2::Cred::default()
            }
        }
    }
}
