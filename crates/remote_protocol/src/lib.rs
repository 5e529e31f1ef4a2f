// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
//! The data model consumed and produced by the worker: directory descriptors, actions,
//! commands, operations and their stages, and action results. These mirror the shape of the
//! Bazel Remote Execution API's messages, but are hand-rolled plain Rust types rather than
//! generated from `.proto` sources, since wire encoding is outside this crate's scope (the
//! worker only ever talks to the RPC surface through the `rpc_client` traits).

use std::collections::BTreeMap;

use hashing::Digest;
use serde::{Deserialize, Serialize};

/// A single file entry within a `Directory`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub digest: Digest,
    pub is_executable: bool,
}

/// A single subdirectory entry within a `Directory`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,
    pub digest: Digest,
}

/// An unordered set of file and subdirectory entries. `digest()` serializes the directory in a
/// canonical (sorted-by-name) form so that two `Directory` values with the same content always
/// hash to the same `Digest`, regardless of the order entries were pushed in.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Directory {
    pub files: Vec<FileNode>,
    pub directories: Vec<DirectoryNode>,
}

impl Directory {
    pub fn new(mut files: Vec<FileNode>, mut directories: Vec<DirectoryNode>) -> Self {
        files.sort_by(|a, b| a.name.cmp(&b.name));
        directories.sort_by(|a, b| a.name.cmp(&b.name));
        Directory { files, directories }
    }

    /// Validates that child names are non-empty, single path segments, sorted, and unique across
    /// both files and directories. This is the same shape of check the REAPI requires of a
    /// canonical `Directory` message.
    pub fn verify_canonical(&self) -> Result<(), String> {
        verify_sorted_unique(&self.files, |f| &f.name)?;
        verify_sorted_unique(&self.directories, |d| &d.name)?;
        let mut seen = std::collections::HashSet::new();
        for name in self
            .files
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.directories.iter().map(|d| d.name.as_str()))
        {
            if !seen.insert(name) {
                return Err(format!(
                    "child path {name:?} present as both a file and a directory"
                ));
            }
        }
        Ok(())
    }

    /// Deterministic byte encoding used only to compute this directory's own digest. Not a wire
    /// format: entries are written in sorted order with length-prefixed fields.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.files.len() as u64).to_le_bytes());
        buf.extend_from_slice(&(self.directories.len() as u64).to_le_bytes());
        for file in &self.files {
            write_field(&mut buf, file.name.as_bytes());
            write_field(&mut buf, file.digest.hash.as_bytes());
            buf.extend_from_slice(&(file.digest.size_bytes as u64).to_le_bytes());
            buf.push(file.is_executable as u8);
        }
        for dir in &self.directories {
            write_field(&mut buf, dir.name.as_bytes());
            write_field(&mut buf, dir.digest.hash.as_bytes());
            buf.extend_from_slice(&(dir.digest.size_bytes as u64).to_le_bytes());
        }
        buf
    }

    pub fn digest(&self) -> Digest {
        Digest::of_bytes(&self.canonical_bytes())
    }

    /// The byte encoding stored in the CAS under this directory's own digest. Reusing the same
    /// canonical encoding for both hashing and storage means `Directory::from_bytes(&self.to_bytes())`
    /// always round-trips.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.canonical_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Directory, String> {
        let mut files = Vec::new();
        let mut directories = Vec::new();
        let mut cursor = bytes;
        // A (file count, directory count) header disambiguates where the file entries end and
        // the directory entries begin, since both share a (name, hash, size) prefix.
        let (num_files, num_dirs) = read_header(&mut cursor)?;
        for _ in 0..num_files {
            let name = read_field_string(&mut cursor)?;
            let hash = read_hash(&mut cursor)?;
            let size_bytes = read_u64(&mut cursor)? as usize;
            let is_executable = read_u8(&mut cursor)? != 0;
            files.push(FileNode {
                name,
                digest: Digest::new(hash, size_bytes),
                is_executable,
            });
        }
        for _ in 0..num_dirs {
            let name = read_field_string(&mut cursor)?;
            let hash = read_hash(&mut cursor)?;
            let size_bytes = read_u64(&mut cursor)? as usize;
            directories.push(DirectoryNode {
                name,
                digest: Digest::new(hash, size_bytes),
            });
        }
        Ok(Directory { files, directories })
    }
}

fn write_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn write_digest(buf: &mut Vec<u8>, digest: Digest) {
    write_field(buf, digest.hash.as_bytes());
    buf.extend_from_slice(&(digest.size_bytes as u64).to_le_bytes());
}

fn read_digest(cursor: &mut &[u8]) -> Result<Digest, String> {
    let hash = read_hash(cursor)?;
    let size_bytes = read_u64(cursor)? as usize;
    Ok(Digest::new(hash, size_bytes))
}

fn read_header(cursor: &mut &[u8]) -> Result<(u64, u64), String> {
    Ok((read_u64(cursor)?, read_u64(cursor)?))
}

fn read_u64(cursor: &mut &[u8]) -> Result<u64, String> {
    if cursor.len() < 8 {
        return Err("truncated directory encoding: expected 8 more bytes".to_string());
    }
    let (head, rest) = cursor.split_at(8);
    *cursor = rest;
    Ok(u64::from_le_bytes(head.try_into().unwrap()))
}

fn read_u8(cursor: &mut &[u8]) -> Result<u8, String> {
    if cursor.is_empty() {
        return Err("truncated directory encoding: expected 1 more byte".to_string());
    }
    let (head, rest) = cursor.split_at(1);
    *cursor = rest;
    Ok(head[0])
}

fn read_field_string(cursor: &mut &[u8]) -> Result<String, String> {
    let len = read_u64(cursor)? as usize;
    if cursor.len() < len {
        return Err("truncated directory encoding: name field ran past end".to_string());
    }
    let (head, rest) = cursor.split_at(len);
    *cursor = rest;
    String::from_utf8(head.to_vec()).map_err(|e| format!("invalid utf-8 in child name: {e}"))
}

fn read_hash(cursor: &mut &[u8]) -> Result<hashing::Fingerprint, String> {
    let len = read_u64(cursor)? as usize;
    if len != hashing::FINGERPRINT_SIZE {
        return Err(format!(
            "expected a {}-byte fingerprint, found {len} bytes",
            hashing::FINGERPRINT_SIZE
        ));
    }
    if cursor.len() < len {
        return Err("truncated directory encoding: digest hash ran past end".to_string());
    }
    let (head, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(hashing::Fingerprint::from_bytes_unsafe(head))
}

fn verify_sorted_unique<T, F: Fn(&T) -> &str>(nodes: &[T], name_of: F) -> Result<(), String> {
    let mut prev: Option<&str> = None;
    for node in nodes {
        let name = name_of(node);
        if name.is_empty() {
            return Err("a child name must not be empty".to_string());
        } else if name.contains('/') {
            return Err(format!("all children must have one path segment, but found {name}"));
        }
        if let Some(p) = prev {
            if name <= p {
                return Err(format!("children must be sorted and unique, but {p} was before {name}"));
            }
        }
        prev = Some(name);
    }
    Ok(())
}

/// A flat, ordered argument vector and a flat environment map that fully replaces the inherited
/// process environment.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Command {
    /// The byte encoding stored in the CAS under this command's own digest.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.argv.len() as u64).to_le_bytes());
        for arg in &self.argv {
            write_field(&mut buf, arg.as_bytes());
        }
        buf.extend_from_slice(&(self.env.len() as u64).to_le_bytes());
        for (key, value) in &self.env {
            write_field(&mut buf, key.as_bytes());
            write_field(&mut buf, value.as_bytes());
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Command, String> {
        let mut cursor = bytes;
        let argc = read_u64(&mut cursor)?;
        let mut argv = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            argv.push(read_field_string(&mut cursor)?);
        }
        let envc = read_u64(&mut cursor)?;
        let mut env = BTreeMap::new();
        for _ in 0..envc {
            let key = read_field_string(&mut cursor)?;
            let value = read_field_string(&mut cursor)?;
            env.insert(key, value);
        }
        Ok(Command { argv, env })
    }
}

/// A hermetic unit of work: command + input tree + output declarations + timeout.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub command_digest: Digest,
    pub input_root_digest: Digest,
    pub output_files: Vec<String>,
    pub output_directories: Vec<String>,
    pub timeout: Option<std::time::Duration>,
    pub do_not_cache: bool,
}

impl Action {
    /// The byte encoding stored in the CAS under this action's own digest.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_digest(&mut buf, self.command_digest);
        write_digest(&mut buf, self.input_root_digest);
        buf.extend_from_slice(&(self.output_files.len() as u64).to_le_bytes());
        for path in &self.output_files {
            write_field(&mut buf, path.as_bytes());
        }
        buf.extend_from_slice(&(self.output_directories.len() as u64).to_le_bytes());
        for path in &self.output_directories {
            write_field(&mut buf, path.as_bytes());
        }
        match self.timeout {
            Some(d) => {
                buf.push(1);
                buf.extend_from_slice(&d.as_secs().to_le_bytes());
                buf.extend_from_slice(&(d.subsec_nanos() as u64).to_le_bytes());
            }
            None => buf.push(0),
        }
        buf.push(self.do_not_cache as u8);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Action, String> {
        let mut cursor = bytes;
        let command_digest = read_digest(&mut cursor)?;
        let input_root_digest = read_digest(&mut cursor)?;
        let num_output_files = read_u64(&mut cursor)?;
        let mut output_files = Vec::with_capacity(num_output_files as usize);
        for _ in 0..num_output_files {
            output_files.push(read_field_string(&mut cursor)?);
        }
        let num_output_dirs = read_u64(&mut cursor)?;
        let mut output_directories = Vec::with_capacity(num_output_dirs as usize);
        for _ in 0..num_output_dirs {
            output_directories.push(read_field_string(&mut cursor)?);
        }
        let has_timeout = read_u8(&mut cursor)? != 0;
        let timeout = if has_timeout {
            let secs = read_u64(&mut cursor)?;
            let nanos = read_u64(&mut cursor)? as u32;
            Some(std::time::Duration::new(secs, nanos))
        } else {
            None
        };
        let do_not_cache = read_u8(&mut cursor)? != 0;
        Ok(Action {
            command_digest,
            input_root_digest,
            output_files,
            output_directories,
            timeout,
            do_not_cache,
        })
    }
}

/// A worker-declared platform capability map, e.g. `{"OSFamily": "linux"}`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub properties: BTreeMap<String, String>,
}

/// The ordered lifecycle of an `Operation` as tracked by the queue. The worker only ever
/// advances an operation's stage forward along this ordering.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Unknown,
    Queued,
    Executing,
    Completed,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOperationMetadata {
    pub stage: Stage,
    pub action_digest: Digest,
    pub stdout_stream_name: String,
    pub stderr_stream_name: String,
}

/// One captured output file: either inlined bytes, a CAS digest, or both, per the insertion
/// policy that produced it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: String,
    pub is_executable: bool,
    pub content: Option<Vec<u8>>,
    pub digest: Option<Digest>,
}

/// The outcome of running an action's command.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub exit_code: i32,
    pub output_files: Vec<OutputFile>,
    pub stdout_raw: Option<Vec<u8>>,
    pub stdout_digest: Option<Digest>,
    pub stderr_raw: Option<Vec<u8>>,
    pub stderr_digest: Option<Digest>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub metadata: ExecuteOperationMetadata,
    pub done: bool,
    pub response: Option<ActionResult>,
}

impl Operation {
    pub fn new(name: String, action_digest: Digest) -> Self {
        Operation {
            name,
            metadata: ExecuteOperationMetadata {
                stage: Stage::Queued,
                action_digest,
                stdout_stream_name: String::new(),
                stderr_stream_name: String::new(),
            },
            done: false,
            response: None,
        }
    }
}

/// The policy governing how a captured stream (stdout, stderr, or an output file) is packaged
/// into an `ActionResult`, relative to a byte-size `limit`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum CasInsertionPolicy {
    #[default]
    Unknown,
    AlwaysInsert,
    InsertAboveLimit,
    NeverInsert,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CasInsertionControl {
    pub limit: usize,
    pub policy: CasInsertionPolicy,
}

impl CasInsertionControl {
    pub fn new(limit: usize, policy: CasInsertionPolicy) -> Self {
        CasInsertionControl { limit, policy }
    }

    /// Whether bytes of this size, under this control, should be kept inline.
    pub fn should_inline(&self, size: usize) -> bool {
        size <= self.limit
    }

    /// Whether bytes of this size, under this control, should be inserted into the CAS.
    pub fn should_insert(&self, size: usize) -> bool {
        if size <= self.limit {
            self.policy == CasInsertionPolicy::AlwaysInsert
        } else {
            matches!(
                self.policy,
                CasInsertionPolicy::InsertAboveLimit | CasInsertionPolicy::AlwaysInsert
            )
        }
    }
}
