// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
//! Turns an input root digest into a real directory tree on disk: recursively fetches each
//! directory blob, indexes directory digests already seen so a subtree shared by multiple
//! parents is only ever fetched once, and hard-links each file's content out of the local CAS
//! cache into its place in the execution directory.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin as StdPin;
use std::sync::Arc;

use cas_cache::Cache;
use hashing::Digest;
use remote_protocol::Directory;

pub struct Materializer {
    cache: Cache,
}

impl Materializer {
    pub fn new(cache: Cache) -> Self {
        Materializer { cache }
    }

    async fn fetch_directory(&self, digest: Digest) -> Result<Directory, String> {
        let pin = self.cache.load(digest).await?;
        let path = self.cache.content_path(&digest.hash);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| format!("failed to read cached directory {}: {e}", path.display()))?;
        drop(pin);
        let directory = Directory::from_bytes(&bytes)?;
        directory.verify_canonical()?;
        Ok(directory)
    }

    /// Materializes the tree rooted at `root_digest` into `dest`, which must not already exist
    /// (or must be empty). Directory digests are fetched at most once even if multiple parents
    /// reference the same subtree; every occurrence of the subtree is still hard-linked into its
    /// own place in `dest`.
    pub async fn materialize(&self, root_digest: Digest, dest: &Path) -> Result<(), String> {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| format!("failed to create execution directory {}: {e}", dest.display()))?;
        let seen = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        self.materialize_dir(root_digest, dest.to_path_buf(), seen).await
    }

    fn materialize_dir(
        &self,
        digest: Digest,
        dest: PathBuf,
        seen: Arc<tokio::sync::Mutex<HashMap<Digest, Directory>>>,
    ) -> StdPin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move {
            log::trace!("materializing {} into {}", digest.hash, dest.display());
            let directory = match seen.lock().await.get(&digest) {
                Some(directory) => directory.clone(),
                None => {
                    let directory = self.fetch_directory(digest).await?;
                    seen.lock().await.insert(digest, directory.clone());
                    directory
                }
            };

            for file in &directory.files {
                let pin = self.cache.load(file.digest).await?;
                let file_dest = dest.join(&file.name);
                self.cache.link_into(file.digest, &file_dest)?;
                set_executable(&file_dest, file.is_executable)?;
                drop(pin);
            }

            for subdir in &directory.directories {
                let subdir_dest = dest.join(&subdir.name);
                tokio::fs::create_dir_all(&subdir_dest)
                    .await
                    .map_err(|e| format!("failed to create {}: {e}", subdir_dest.display()))?;
                self.materialize_dir(subdir.digest, subdir_dest, seen.clone())
                    .await?;
            }

            Ok(())
        })
    }

    /// Creates the parent directory in `dest` for each declared output file path, so a command
    /// can write to a nested path like `out/a.bin` without having to create `out/` itself.
    pub async fn create_output_parents(&self, dest: &Path, output_files: &[String]) -> Result<(), String> {
        for relative_path in output_files {
            if let Some(parent) = Path::new(relative_path).parent().filter(|p| !p.as_os_str().is_empty()) {
                let full = dest.join(parent);
                tokio::fs::create_dir_all(&full)
                    .await
                    .map_err(|e| format!("failed to create output parent directory {}: {e}", full.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)
        .map_err(|e| format!("failed to stat {}: {e}", path.display()))?
        .permissions();
    let mode = if executable { 0o755 } else { 0o644 };
    perms.set_mode(mode);
    std::fs::set_permissions(path, perms)
        .map_err(|e| format!("failed to set permissions on {}: {e}", path.display()))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> Result<(), String> {
    Ok(())
}
