// # Group profile configuration
//
// `profiles.yml` maps group names to browser profile fragments. A user's
// effective profile is the cumulative merge of every matching group profile
// in ascending priority order, deduplicated by URL, with entries from the
// reserved `_users` section winning over everything.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::Result;

const USERS_SECTION: &str = "_users";
const DEFAULT_PROFILE: &str = "default";
const DEFAULT_HOMEPAGE: &str = "about:blank";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Bookmark {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AutofillEntry {
    pub url: String,
    #[serde(flatten)]
    pub fields: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub description: String,
    pub priority: i32,
    pub homepage: Option<String>,
    pub bookmarks: Vec<Bookmark>,
    pub autofill: Vec<AutofillEntry>,
}

/// Effective per-user configuration after the group merge.
#[derive(Debug, Clone, Default)]
pub struct EffectiveProfile {
    pub homepage: String,
    pub bookmarks: Vec<Bookmark>,
    pub autofill: Vec<AutofillEntry>,
    /// Profile names that contributed, in merge order.
    pub groups: Vec<String>,
}

impl EffectiveProfile {
    pub fn homepage_or_blank(&self) -> &str {
        if self.homepage.is_empty() {
            DEFAULT_HOMEPAGE
        } else {
            &self.homepage
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProfilesConfig {
    profiles: HashMap<String, Profile>,
    users: HashMap<String, Profile>,
}

impl ProfilesConfig {
    /// Load `profiles.yml`. A missing or unparsable file degrades to a
    /// single empty `default` profile; profile problems must never block
    /// provisioning.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            warn!("profiles config not found: {}", path.display());
            return Self::fallback();
        }
        match std::fs::read_to_string(path) {
            Ok(raw) => match Self::from_yaml(&raw) {
                Ok(cfg) => {
                    info!(
                        "loaded {} profiles from {}",
                        cfg.profiles.len(),
                        path.display()
                    );
                    cfg
                }
                Err(e) => {
                    error!("error parsing profiles config: {e}");
                    Self::fallback()
                }
            },
            Err(e) => {
                error!("error reading profiles config: {e}");
                Self::fallback()
            }
        }
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut sections: HashMap<String, serde_yaml::Value> = serde_yaml::from_str(raw)?;
        let users = match sections.remove(USERS_SECTION) {
            Some(value) => serde_yaml::from_value(value)?,
            None => HashMap::new(),
        };
        let mut profiles = HashMap::new();
        for (name, value) in sections {
            if name.starts_with('_') {
                continue;
            }
            profiles.insert(name, serde_yaml::from_value(value)?);
        }
        Ok(Self { profiles, users })
    }

    fn fallback() -> Self {
        Self {
            profiles: HashMap::from([(DEFAULT_PROFILE.to_string(), Profile::default())]),
            users: HashMap::new(),
        }
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Merge the profiles matching `user_groups` into one effective
    /// configuration for `username`.
    pub fn effective(&self, user_groups: &[String], username: Option<&str>) -> EffectiveProfile {
        let mut matched: Vec<(&String, &Profile)> = user_groups
            .iter()
            .filter_map(|g| self.profiles.get_key_value(g))
            .collect();

        // The default profile always participates unless the user is
        // explicitly in a group of that name.
        if !user_groups.iter().any(|g| g == DEFAULT_PROFILE) {
            if let Some(entry) = self.profiles.get_key_value(DEFAULT_PROFILE) {
                matched.push(entry);
            }
        }

        // Ascending priority: the highest-priority homepage lands last.
        matched.sort_by_key(|(_, p)| p.priority);

        let mut effective = EffectiveProfile {
            homepage: DEFAULT_HOMEPAGE.to_string(),
            ..Default::default()
        };
        let mut seen_bookmarks: HashSet<&str> = HashSet::new();
        let mut seen_autofill: HashSet<&str> = HashSet::new();

        for (name, profile) in &matched {
            effective.groups.push((*name).clone());
            for bm in &profile.bookmarks {
                if !bm.url.is_empty() && seen_bookmarks.insert(&bm.url) {
                    effective.bookmarks.push(bm.clone());
                }
            }
            for af in &profile.autofill {
                if !af.url.is_empty() && seen_autofill.insert(&af.url) {
                    effective.autofill.push(af.clone());
                }
            }
            if let Some(home) = &profile.homepage {
                if !home.is_empty() {
                    effective.homepage = home.clone();
                }
            }
        }

        if let Some(user_cfg) = username.and_then(|u| self.users.get(u)) {
            if let Some(home) = &user_cfg.homepage {
                if !home.is_empty() {
                    effective.homepage = home.clone();
                }
            }
            for bm in user_cfg.bookmarks.iter().rev() {
                if !bm.url.is_empty() && seen_bookmarks.insert(&bm.url) {
                    effective.bookmarks.insert(0, bm.clone());
                }
            }
            for af in user_cfg.autofill.iter().rev() {
                if !af.url.is_empty() && seen_autofill.insert(&af.url) {
                    effective.autofill.insert(0, af.clone());
                }
            }
        }

        effective
    }
}
