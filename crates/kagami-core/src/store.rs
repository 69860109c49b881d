//! Enrolled face templates on disk, cached in memory per identity.
//!
//! Layout under the store root: `<user>.json` and/or `<user>/*.json`. Each
//! file holds a JSON array of records (or an object with an `embeddings`
//! array); a record carries an `embedding` (alias `descriptor`) and an
//! optional `id`. Unknown fields are ignored.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::{AuthError, AuthResult};
use crate::matcher::{self, EnrolledIdentity};

pub trait ModelCache: Send + Sync {
    fn has_model(&self, username: &str) -> bool;

    fn load_model(&self, username: &str) -> AuthResult<EnrolledIdentity>;

    fn identities(&self) -> AuthResult<Vec<String>>;

    /// Loads every identity with at most `threads` loaders. Identities whose
    /// files fail to load are skipped with a warning.
    fn load_all_parallel(&self, threads: usize) -> AuthResult<Vec<EnrolledIdentity>> {
        let usernames = self.identities()?;
        if usernames.is_empty() {
            return Ok(Vec::new());
        }
        let chunk = usernames.len().div_ceil(threads.max(1));

        let loaded: Vec<Option<EnrolledIdentity>> = thread::scope(|scope| {
            let handles: Vec<_> = usernames
                .chunks(chunk)
                .map(|names| {
                    scope.spawn(move || {
                        names
                            .iter()
                            .map(|name| match self.load_model(name) {
                                Ok(identity) => Some(identity),
                                Err(err) => {
                                    warn!(target: "kagami::store", user = %name, error = %err, "skipping identity");
                                    None
                                }
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap_or_default())
                .collect()
        });

        Ok(loaded
            .into_iter()
            .flatten()
            .filter(|identity| !identity.templates.is_empty())
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct TemplateRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "descriptor")]
    embedding: Vec<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TemplateFile {
    List(Vec<TemplateRecord>),
    Wrapped { embeddings: Vec<TemplateRecord> },
}

impl TemplateFile {
    fn into_records(self) -> Vec<TemplateRecord> {
        match self {
            TemplateFile::List(records) => records,
            TemplateFile::Wrapped { embeddings } => embeddings,
        }
    }
}

type Signature = Vec<(PathBuf, Option<SystemTime>, u64)>;

#[derive(Debug)]
struct CachedIdentity {
    signature: Signature,
    identity: EnrolledIdentity,
}

/// Template store rooted at `embedding_store_dir`. Parsed identities are
/// reused until any of their files changes size or modification time.
#[derive(Debug)]
pub struct FilesystemModelCache {
    root: PathBuf,
    cache: RwLock<HashMap<String, CachedIdentity>>,
}

impl FilesystemModelCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn template_files(&self, username: &str) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let single = self.root.join(format!("{username}.json"));
        if single.is_file() {
            files.push(single);
        }
        if let Ok(entries) = fs::read_dir(self.root.join(username)) {
            let mut nested: Vec<PathBuf> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && is_json(path))
                .collect();
            nested.sort();
            files.extend(nested);
        }
        files
    }

    fn cached(&self, username: &str, signature: &Signature) -> Option<EnrolledIdentity> {
        let cache = self.cache.read();
        cache
            .get(username)
            .filter(|entry| &entry.signature == signature)
            .map(|entry| entry.identity.clone())
    }
}

impl ModelCache for FilesystemModelCache {
    fn has_model(&self, username: &str) -> bool {
        validate_user_name(username).is_ok() && !self.template_files(username).is_empty()
    }

    fn load_model(&self, username: &str) -> AuthResult<EnrolledIdentity> {
        validate_user_name(username)?;
        let files = self.template_files(username);
        let signature = signature_of(&files);
        if let Some(identity) = self.cached(username, &signature) {
            debug!(target: "kagami::store", user = %username, "template cache hit");
            return Ok(identity);
        }

        let mut templates = Vec::new();
        for path in &files {
            templates.extend(read_templates(path)?);
        }
        debug!(
            target: "kagami::store",
            user = %username,
            files = files.len(),
            templates = templates.len(),
            "loaded templates"
        );
        let identity = EnrolledIdentity::new(username, templates);
        self.cache.write().insert(
            username.to_string(),
            CachedIdentity {
                signature,
                identity: identity.clone(),
            },
        );
        Ok(identity)
    }

    fn identities(&self) -> AuthResult<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(AuthError::TemplateRead {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut names = BTreeSet::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let candidate = if path.is_dir() {
                entry.file_name().to_str().map(str::to_string)
            } else if is_json(&path) {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            } else {
                None
            };
            if let Some(name) = candidate {
                if validate_user_name(&name).is_ok() && !self.template_files(&name).is_empty() {
                    names.insert(name);
                }
            }
        }
        Ok(names.into_iter().collect())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("json")
}

fn signature_of(files: &[PathBuf]) -> Signature {
    files
        .iter()
        .map(|path| {
            let metadata = fs::metadata(path).ok();
            (
                path.clone(),
                metadata.as_ref().and_then(|m| m.modified().ok()),
                metadata.map_or(0, |m| m.len()),
            )
        })
        .collect()
}

fn read_templates(path: &Path) -> AuthResult<Vec<Vec<f64>>> {
    let data = fs::read(path).map_err(|source| AuthError::TemplateRead {
        path: path.to_path_buf(),
        source,
    })?;
    let file: TemplateFile =
        serde_json::from_slice(&data).map_err(|err| AuthError::InvalidTemplateFile {
            path: path.to_path_buf(),
            message: format!("invalid template contents: {err}"),
        })?;

    let records = file.into_records();
    let expected_len = records.first().map_or(0, |record| record.embedding.len());
    let mut templates = Vec::with_capacity(records.len());
    for (idx, record) in records.into_iter().enumerate() {
        let label = record.id.unwrap_or_else(|| format!("index {idx}"));
        if record.embedding.len() != expected_len {
            return Err(AuthError::InvalidTemplateFile {
                path: path.to_path_buf(),
                message: format!(
                    "embedding length mismatch at {label} (expected {expected_len}, found {})",
                    record.embedding.len()
                ),
            });
        }
        let unit = matcher::normalize(&record.embedding).ok_or_else(|| {
            AuthError::InvalidTemplateFile {
                path: path.to_path_buf(),
                message: format!("{label} has a zero-magnitude embedding"),
            }
        })?;
        templates.push(unit);
    }
    Ok(templates)
}

pub fn validate_user_name(user: &str) -> AuthResult<()> {
    if user.is_empty() {
        return Err(AuthError::InvalidUser {
            user: user.to_string(),
            message: "user name cannot be empty".into(),
        });
    }
    if user.starts_with('.') {
        return Err(AuthError::InvalidUser {
            user: user.to_string(),
            message: "user name cannot start with '.'".into(),
        });
    }
    if !user
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(AuthError::InvalidUser {
            user: user.to_string(),
            message: "use ASCII letters, numbers, '.', '-' or '_' only".into(),
        });
    }
    Ok(())
}
