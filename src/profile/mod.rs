// # User profiles
//
// Per-user state on the shared volume plus the effective group
// configuration. Generating the actual browser policy files is the
// workload image's concern; the broker only guarantees the directory
// exists and resolves which configuration applies.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{EffectiveProfile, ProfilesConfig, Settings};
use crate::error::{BrokerError, Result};

pub struct UserProfiles {
    data_root: PathBuf,
    profiles: ProfilesConfig,
}

impl UserProfiles {
    pub fn new(settings: &Arc<Settings>, profiles: ProfilesConfig) -> Self {
        Self {
            data_root: settings.profile.data_root.clone(),
            profiles,
        }
    }

    pub fn user_path(&self, username: &str) -> PathBuf {
        // Usernames come from the gateway, but never trust them as path
        // components.
        let safe: String = username
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.data_root.join(safe)
    }

    /// Create the user's profile directory when missing.
    pub fn ensure_profile(&self, username: &str) -> Result<PathBuf> {
        let path = self.user_path(username);
        if !path.exists() {
            std::fs::create_dir_all(&path).map_err(|e| {
                BrokerError::Io(std::io::Error::new(
                    e.kind(),
                    format!("profile dir {}: {e}", path.display()),
                ))
            })?;
            info!("created profile directory for {username}");
        }
        Ok(path)
    }

    /// Effective configuration for a user given their gateway groups.
    pub fn effective_config(&self, username: &str, user_groups: &[String]) -> EffectiveProfile {
        let effective = self.profiles.effective(user_groups, Some(username));
        debug!(
            "configuration for {username}: groups {:?}, {} bookmarks, homepage {}",
            effective.groups,
            effective.bookmarks.len(),
            effective.homepage_or_blank()
        );
        effective
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn profiles_in(dir: &Path) -> UserProfiles {
        let mut settings = Settings::default();
        settings.profile.data_root = dir.to_path_buf();
        UserProfiles::new(&Arc::new(settings), ProfilesConfig::default())
    }

    #[test]
    fn ensure_profile_creates_the_directory_once() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = profiles_in(dir.path());

        let path = profiles.ensure_profile("alice").unwrap();
        assert!(path.is_dir());
        // Second call is a no-op.
        assert_eq!(profiles.ensure_profile("alice").unwrap(), path);
    }

    #[test]
    fn user_paths_never_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = profiles_in(dir.path());

        let path = profiles.user_path("../../etc/passwd");
        assert!(path.starts_with(dir.path()));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            ".._.._etc_passwd"
        );
    }
}
