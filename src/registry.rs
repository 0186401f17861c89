//! Table of open files: the one mapping from path to pipe.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{pipe::Netpipe, socket::PeerSocket};

/// Mapping from path to pipe, with get-or-create and removal.
///
/// Lock order: the registry lock is acquired strictly before any pipe lock,
/// never while one is held. That is why removal is a separate re-checked
/// step ([`Registry::remove_if_defunct`]) instead of something a pipe does
/// to itself under its own lock.
pub struct Registry {
    socket: Arc<PeerSocket>,
    readahead: usize,
    writeahead: usize,
    pipes: Mutex<HashMap<String, Arc<Netpipe>>>,
}

impl Registry {
    pub(crate) fn new(socket: Arc<PeerSocket>, readahead: usize, writeahead: usize) -> Self {
        Self {
            socket,
            readahead,
            writeahead,
            pipes: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up the pipe for `path`.
    pub fn get(&self, path: &str) -> Option<Arc<Netpipe>> {
        self.pipes.lock().unwrap().get(path).cloned()
    }

    /// Returns the pipe for `path`, inserting a fresh unopened one if none
    /// exists yet. The boolean reports whether it was just created.
    pub fn get_or_create(&self, path: &str) -> (Arc<Netpipe>, bool) {
        let mut pipes = self.pipes.lock().unwrap();
        if let Some(pipe) = pipes.get(path) {
            return (pipe.clone(), false);
        }
        let pipe = Arc::new(Netpipe::new(
            path,
            self.socket.clone(),
            self.readahead,
            self.writeahead,
        ));
        pipes.insert(path.to_owned(), pipe.clone());
        (pipe, true)
    }

    /// Unlinks `path` if the pipe is still fully closed with nothing in
    /// flight once both locks are held.
    pub fn remove_if_defunct(&self, path: &str) {
        let mut pipes = self.pipes.lock().unwrap();
        if let Some(pipe) = pipes.get(path) {
            if pipe.is_defunct() {
                pipes.remove(path);
            }
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.pipes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force-exits every pipe so that all blocked operations unblock with a
    /// terminal error.
    pub fn shutdown(&self) {
        let pipes = self.pipes.lock().unwrap();
        for pipe in pipes.values() {
            pipe.force_exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::Transport;
    use std::os::unix::net::UnixStream;

    fn test_registry() -> (Registry, UnixStream) {
        let (near, far) = UnixStream::pair().unwrap();
        let socket = Arc::new(PeerSocket::new(Transport::Unix(near), 16));
        (Registry::new(socket, 16, 16), far)
    }

    #[test]
    fn get_on_missing_path_returns_none() {
        let (registry, _far) = test_registry();
        assert!(registry.get("/filename.txt").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn get_or_create_inserts_once() {
        let (registry, _far) = test_registry();
        let path = "/filename.txt";

        let (pipe, just_created) = registry.get_or_create(path);
        assert!(just_created);
        assert_eq!(pipe.path(), path);

        let (again, just_created) = registry.get_or_create(path);
        assert!(!just_created);
        assert!(Arc::ptr_eq(&pipe, &again));

        let found = registry.get(path).expect("pipe should be registered");
        assert!(Arc::ptr_eq(&pipe, &found));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_if_defunct_only_removes_unused_pipes() {
        let (registry, _far) = test_registry();
        let (pipe, _) = registry.get_or_create("/a");

        // A fresh pipe has no participants and nothing in flight.
        registry.remove_if_defunct("/a");
        assert!(registry.get("/a").is_none());

        // A pipe with a remote participant stays.
        let (pipe2, _) = registry.get_or_create("/b");
        pipe2.open_update(crate::proto::OpenMode::Write);
        registry.remove_if_defunct("/b");
        assert!(registry.get("/b").is_some());

        drop(pipe);
    }

    #[test]
    fn remove_of_unknown_path_is_a_no_op() {
        let (registry, _far) = test_registry();
        registry.get_or_create("/a");
        registry.remove_if_defunct("/badpath");
        assert_eq!(registry.len(), 1);
    }
}
