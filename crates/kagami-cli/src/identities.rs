use std::path::{Path, PathBuf};

use kagami_config::load_resolved_config;
use kagami_core::store::{FilesystemModelCache, ModelCache};
use serde::Serialize;

use crate::cli::IdentitiesArgs;
use crate::errors::AppResult;

#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub user: String,
    pub files: usize,
    pub templates: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnreadableIdentity {
    pub user: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentitiesReport {
    pub store_dir: PathBuf,
    pub identities: Vec<IdentitySummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unreadable: Vec<UnreadableIdentity>,
}

pub fn run_identities(args: &IdentitiesArgs) -> AppResult<IdentitiesReport> {
    let store_dir = match &args.store_dir {
        Some(dir) => dir.clone(),
        None => load_resolved_config()?.resolved.embedding_store_dir,
    };
    list_identities(&store_dir)
}

pub fn list_identities(store_dir: &Path) -> AppResult<IdentitiesReport> {
    let cache = FilesystemModelCache::new(store_dir);
    let mut identities = Vec::new();
    let mut unreadable = Vec::new();

    for user in cache.identities()? {
        match cache.load_model(&user) {
            Ok(identity) => identities.push(IdentitySummary {
                files: cache.template_files(&user).len(),
                templates: identity.templates.len(),
                user,
            }),
            Err(err) => unreadable.push(UnreadableIdentity {
                user,
                error: err.to_string(),
            }),
        }
    }

    Ok(IdentitiesReport {
        store_dir: store_dir.to_path_buf(),
        identities,
        unreadable,
    })
}
