use serde::Deserialize;
use std::{collections::HashSet, fs, path::Path};

use crate::envelope::Creator;

#[derive(Debug, Deserialize)]
pub struct CreatorPolicy {
    #[serde(default)]
    pub allow_ids: Vec<String>,
}

impl CreatorPolicy {
    fn load_from(path: &Path) -> Option<Self> {
        let data = fs::read_to_string(path).ok()?;
        match toml::from_str::<Self>(&data) {
            Ok(policy) => Some(policy),
            Err(e) => {
                log::warn!("ignoring malformed creator policy {}: {e}", path.display());
                None
            }
        }
    }
}

/// Allow-list of proposal creators the peer will endorse.
///
/// Entries match either `msp_id:credentials` or the bare credentials string.
/// No list (or an empty one) admits everyone.
#[derive(Debug, Default)]
pub struct CreatorGuard {
    allow: Option<HashSet<String>>,
}

impl CreatorGuard {
    pub fn allow_all() -> Self {
        Self { allow: None }
    }

    pub fn from_ids<I: IntoIterator<Item = String>>(ids: I) -> Self {
        let set: HashSet<String> = ids.into_iter().collect();
        if set.is_empty() {
            Self::allow_all()
        } else {
            Self { allow: Some(set) }
        }
    }

    pub fn load(path: Option<&Path>) -> Self {
        path.and_then(CreatorPolicy::load_from)
            .map(|cfg| Self::from_ids(cfg.allow_ids))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn allowed(&self, creator: &Creator) -> bool {
        self.allow.as_ref().is_none_or(|set| {
            set.contains(&creator.qualified_id()) || set.contains(&creator.credentials)
        })
    }
}
