/// Signed-in session: bearer token, backend URL and the validated profile.
///
/// Persisted as a versioned JSON file in the data directory so the CLI and
/// the long-running client share one credential.
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::types::{UserId, UserProfile};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

const SESSION_FILE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub api_url: String,
    pub access_token: String,
    pub profile: Option<UserProfile>,
    /// RFC3339
    pub established_at: String,
}

impl Session {
    pub fn new(api_url: &str, access_token: &str) -> Result<Self> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(ChatError::Session("access token is empty".to_string()));
        }
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            profile: None,
            established_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    pub fn attach_profile(&mut self, profile: UserProfile) {
        self.profile = Some(profile);
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.profile.as_ref().map(|p| p.id)
    }

    pub fn is_current_user(&self, user: UserId) -> bool {
        self.user_id() == Some(user)
    }

    pub fn display_name(&self) -> String {
        match &self.profile {
            Some(p) => {
                let full = format!("{} {}", p.first_name, p.last_name);
                let full = full.trim();
                if full.is_empty() {
                    p.username.clone()
                } else {
                    full.to_string()
                }
            }
            None => "(not validated)".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFileV1 {
    version: u8,
    session: Session,
}

/// Session file in the data directory
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("session.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Session>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        let parsed: SessionFileV1 = serde_json::from_str(&raw)?;
        if parsed.version != SESSION_FILE_VERSION {
            return Err(ChatError::Session(format!(
                "Unsupported session file version: {}",
                parsed.version
            )));
        }
        Ok(Some(parsed.session))
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = SessionFileV1 {
            version: SESSION_FILE_VERSION,
            session: session.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        write_private(&self.path, json.as_bytes())?;
        info!("Session saved to {}", self.path.display());
        Ok(())
    }

    /// Remove the stored session; returns whether one existed
    pub fn clear(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path)?;
        info!("Session cleared");
        Ok(true)
    }
}

/// Write `data` to a file only the owner can read, from the first byte
fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    // The creation mode does not apply to a file that already exists
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

/// Credentials for a client run: an explicit token from the config wins,
/// otherwise the stored session (with its backend URL) is used.
pub fn resolve_session(config: &Config) -> Result<Option<Session>> {
    if let Some(token) = &config.token {
        return Session::new(&config.api_url, token).map(Some);
    }
    SessionStore::new(&config.data_dir).load()
}
