//! In-process transport
//!
//! A shared file tree that behaves like a small FTP server: directories must
//! exist before files are stored in them, listings name the files directly
//! inside a directory, and closed sessions reject commands. Faults can be
//! injected per path to exercise the pipeline's error handling.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use txload_common::types::join_path;

use super::{TransportConnector, TransportError, TransportSession};

#[derive(Debug, Default)]
struct Shared {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    connect_limit: Option<usize>,
    failing_lists: HashSet<String>,
    failing_retrieves: HashSet<String>,
    failing_stores: HashSet<String>,
    connects: usize,
    closes: usize,
}

impl Shared {
    fn dir_exists(&self, dir: &str) -> bool {
        if dir.is_empty() || dir == "/" || self.dirs.contains(dir) {
            return true;
        }
        let prefix = format!("{}/", dir);
        self.files.keys().any(|f| f.starts_with(&prefix))
    }

    fn add_dirs(&mut self, dir: &str) {
        let mut current = String::new();
        if dir.starts_with('/') {
            current.push('/');
        }
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() && !current.ends_with('/') {
                current.push('/');
            }
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }
}

fn normalize(path: &str) -> String {
    join_path(&[path])
}

fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((dir, _)) => dir,
        None => "",
    }
}

/// Connector and inspection handle for an in-memory tree
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place a file, creating its directories
    pub fn put(&self, path: &str, data: impl Into<Vec<u8>>) {
        let path = normalize(path);
        let mut shared = self.lock();
        shared.add_dirs(parent(&path));
        shared.files.insert(path, data.into());
    }

    pub fn mkdir(&self, dir: &str) {
        self.lock().add_dirs(&normalize(dir));
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(&normalize(path)).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().files.contains_key(&normalize(path))
    }

    /// Sorted file names directly inside `dir`
    pub fn files_in(&self, dir: &str) -> Vec<String> {
        let dir = normalize(dir);
        self.lock()
            .files
            .keys()
            .filter(|f| parent(f) == dir)
            .map(|f| f.rsplit('/').next().unwrap_or(f).to_string())
            .collect()
    }

    /// Let `n` connects succeed, fail every one after that
    pub fn fail_connect_after(&self, n: usize) {
        self.lock().connect_limit = Some(n);
    }

    /// Listing `dir` fails as if the control connection dropped
    pub fn fail_list(&self, dir: &str) {
        self.lock().failing_lists.insert(normalize(dir));
    }

    pub fn fail_retrieve(&self, path: &str) {
        self.lock().failing_retrieves.insert(normalize(path));
    }

    pub fn fail_store(&self, path: &str) {
        self.lock().failing_stores.insert(normalize(path));
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }
}

#[async_trait]
impl TransportConnector for MemoryTransport {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession, TransportError> {
        let mut shared = self.lock();
        if shared.connect_limit.is_some_and(|limit| shared.connects >= limit) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        shared.connects += 1;

        Ok(MemorySession {
            shared: self.shared.clone(),
            open: true,
        })
    }
}

/// Session onto a [`MemoryTransport`] tree
#[derive(Debug)]
pub struct MemorySession {
    shared: Arc<Mutex<Shared>>,
    open: bool,
}

impl MemorySession {
    fn lock(&self) -> Result<MutexGuard<'_, Shared>, TransportError> {
        if !self.open {
            return Err(TransportError::SessionClosed);
        }
        Ok(self.shared.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    async fn list(&mut self, dir: &str) -> Result<Vec<String>, TransportError> {
        let dir = normalize(dir);
        let shared = self.lock()?;
        if shared.failing_lists.contains(&dir) {
            return Err(TransportError::Io(std::io::Error::other(format!(
                "connection reset while listing {}",
                dir
            ))));
        }
        if !shared.dir_exists(&dir) {
            return Err(TransportError::NotFound(dir));
        }

        Ok(shared
            .files
            .keys()
            .filter(|f| parent(f) == dir)
            .map(|f| f.rsplit('/').next().unwrap_or(f).to_string())
            .collect())
    }

    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, TransportError> {
        let path = normalize(path);
        let shared = self.lock()?;
        if shared.failing_retrieves.contains(&path) {
            return Err(TransportError::Io(std::io::Error::other(format!(
                "injected retrieve failure for {}",
                path
            ))));
        }
        shared
            .files
            .get(&path)
            .cloned()
            .ok_or(TransportError::NotFound(path))
    }

    async fn store(&mut self, path: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let path = normalize(path);
        let mut shared = self.lock()?;
        if shared.failing_stores.contains(&path) {
            return Err(TransportError::Io(std::io::Error::other(format!(
                "injected store failure for {}",
                path
            ))));
        }
        if !shared.dir_exists(parent(&path)) {
            return Err(TransportError::NotFound(parent(&path).to_string()));
        }
        shared.files.insert(path, data);
        Ok(())
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), TransportError> {
        let (from, to) = (normalize(from), normalize(to));
        let mut shared = self.lock()?;
        if !shared.dir_exists(parent(&to)) {
            return Err(TransportError::NotFound(parent(&to).to_string()));
        }
        let data = shared
            .files
            .remove(&from)
            .ok_or_else(|| TransportError::NotFound(from.clone()))?;
        shared.files.insert(to, data);
        Ok(())
    }

    async fn delete(&mut self, path: &str) -> Result<(), TransportError> {
        let path = normalize(path);
        let mut shared = self.lock()?;
        shared
            .files
            .remove(&path)
            .map(|_| ())
            .ok_or(TransportError::NotFound(path))
    }

    async fn make_dir(&mut self, path: &str) -> Result<(), TransportError> {
        let path = normalize(path);
        self.lock()?.add_dirs(&path);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.open {
            self.open = false;
            self.shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .closes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_requires_directory() {
        let transport = MemoryTransport::new();
        let mut session = transport.connect().await.unwrap();

        let err = session.store("/out/T01/main/request.txt", b"x".to_vec()).await;
        assert!(matches!(err, Err(TransportError::NotFound(_))));

        session.make_dir("/out/T01/main").await.unwrap();
        session
            .store("/out/T01/main/request.txt", b"x".to_vec())
            .await
            .unwrap();
        assert_eq!(transport.get("/out/T01/main/request.txt").unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_list_direct_children_only() {
        let transport = MemoryTransport::new();
        transport.put("/in/T01/main/a.txt", "a");
        transport.put("/in/T01/main/b.txt", "b");
        transport.put("/in/T01/main/sub/c.txt", "c");
        transport.mkdir("/in/T02/main");

        let mut session = transport.connect().await.unwrap();
        assert_eq!(session.list("/in/T01/main").await.unwrap(), vec!["a.txt", "b.txt"]);
        assert!(session.list("/in/T02/main").await.unwrap().is_empty());
        assert!(matches!(session.list("/in/T03").await, Err(TransportError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let transport = MemoryTransport::new();
        transport.put("/in/a.tmp", "");
        let mut session = transport.connect().await.unwrap();

        session.rename("/in/a.tmp", "/in/a").await.unwrap();
        assert!(transport.exists("/in/a"));
        assert!(!transport.exists("/in/a.tmp"));

        session.delete("/in/a").await.unwrap();
        assert!(matches!(session.delete("/in/a").await, Err(TransportError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_closed_session_and_counters() {
        let transport = MemoryTransport::new();
        transport.fail_connect_after(1);

        let mut session = transport.connect().await.unwrap();
        assert!(transport.connect().await.is_err());

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(transport.connects(), 1);
        assert_eq!(transport.closes(), 1);
        assert!(matches!(session.list("/").await, Err(TransportError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_injected_retrieve_failure() {
        let transport = MemoryTransport::new();
        transport.put("/in/a.txt", "a");
        transport.fail_retrieve("/in/a.txt");
        let mut session = transport.connect().await.unwrap();
        assert!(matches!(session.retrieve("/in/a.txt").await, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_injected_list_failure() {
        let transport = MemoryTransport::new();
        transport.put("/in/T01/a.txt", "a");
        transport.fail_list("/in/T01/");
        let mut session = transport.connect().await.unwrap();
        assert!(matches!(session.list("/in/T01").await, Err(TransportError::Io(_))));
        assert_eq!(session.list("/in").await.unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_parent() {
        assert_eq!(parent("/in/a.txt"), "/in");
        assert_eq!(parent("/a.txt"), "/");
        assert_eq!(parent("a.txt"), "");
    }
}
