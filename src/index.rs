//! In-memory tree of directories and files, with save/load through the
//! [`crate::codec`] and [`crate::envelope`].
//!
//! Parent back-references are the one place a naive port of the tree would
//! fight the borrow checker (child-owns-parent-owns-children cycles). This
//! implementation follows the arena approach: every [`Node`] lives in a
//! flat `Vec`, addressed by its integer position, and a child merely stores
//! its parent's index rather than a reference to it.

use crate::codec;
use crate::envelope;
use crate::error::{Error, Result};
use crate::utils;
use log::trace;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

pub type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug)]
struct Node {
    name: String,
    opaque_name: String,
    parent: Option<NodeId>,
    kind: NodeKind,
}

#[derive(Debug)]
enum NodeKind {
    File,
    Directory {
        uid: u32,
        gid: u32,
        mode: u32,
        atime: u64,
        mtime: u64,
        ctime: u64,
        children: BTreeMap<String, NodeId>,
    },
}

/// A read-only snapshot of a resolved node, returned by the index's lookup
/// and mutation methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File {
        name: String,
        opaque_name: String,
    },
    Directory {
        name: String,
        opaque_name: String,
        uid: u32,
        gid: u32,
        mode: u32,
        atime: u64,
        mtime: u64,
        ctime: u64,
        num_subdirs: usize,
    },
}

impl Entry {
    pub fn is_directory(&self) -> bool {
        matches!(self, Entry::Directory { .. })
    }

    pub fn opaque_name(&self) -> &str {
        match self {
            Entry::File { opaque_name, .. } | Entry::Directory { opaque_name, .. } => opaque_name,
        }
    }
}

pub struct Index {
    db_path: PathBuf,
    password: Vec<u8>,
    arena: Vec<Node>,
}

impl Index {
    /// Loads the database at `db_path`, or creates a fresh empty root and
    /// saves it if no database file exists yet. Any other load failure
    /// (bad magic, wrong password, malformed struct) propagates.
    pub fn load_or_create(db_path: impl Into<PathBuf>, password: impl Into<Vec<u8>>) -> Result<Self> {
        let db_path = db_path.into();
        let password = password.into();

        match fs::read(&db_path) {
            Ok(sealed) => {
                trace!("index: loading database at {}", db_path.display());
                let plaintext = envelope::open(&sealed, &password)?;
                let root_entry = codec::decode_entry(&mut plaintext.as_slice())?;
                if !root_entry.is_directory() || root_entry.name() != "/" {
                    return Err(Error::Format("root is not a directory named \"/\"".into()));
                }

                let mut arena = Vec::new();
                build_arena(root_entry, None, &mut arena);
                Ok(Self {
                    db_path,
                    password,
                    arena,
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                trace!(
                    "index: no database at {}, creating a fresh root",
                    db_path.display()
                );
                let arena = vec![Node {
                    name: "/".into(),
                    opaque_name: "/".into(),
                    parent: None,
                    kind: NodeKind::Directory {
                        uid: 0,
                        gid: 0,
                        mode: 0o755,
                        atime: 0,
                        mtime: 0,
                        ctime: 0,
                        children: BTreeMap::new(),
                    },
                }];
                let index = Self {
                    db_path,
                    password,
                    arena,
                };
                index.save()?;
                Ok(index)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get(&self, path: &str) -> Result<Entry> {
        let id = self.resolve(path)?;
        Ok(self.snapshot(id))
    }

    pub fn get_or_create_file(&mut self, path: &str) -> Result<Entry> {
        match self.get(path) {
            Ok(entry) => Ok(entry),
            Err(Error::NotFound(_)) => self.create_file(path),
            Err(other) => Err(other),
        }
    }

    pub fn create_file(&mut self, path: &str) -> Result<Entry> {
        let (parent_id, basename) = self.resolve_parent(path)?;
        self.ensure_name_free(parent_id, basename, path)?;

        let opaque_name = self.fresh_opaque_name();
        let id = self.arena.len();
        self.arena.push(Node {
            name: basename.to_string(),
            opaque_name,
            parent: Some(parent_id),
            kind: NodeKind::File,
        });
        self.insert_child(parent_id, basename.to_string(), id);
        self.save()?;
        Ok(self.snapshot(id))
    }

    pub fn mkdir(&mut self, path: &str, uid: u32, gid: u32, mode: u32) -> Result<Entry> {
        let (parent_id, basename) = self.resolve_parent(path)?;
        self.ensure_name_free(parent_id, basename, path)?;

        let now = now_secs();
        let id = self.arena.len();
        self.arena.push(Node {
            name: basename.to_string(),
            opaque_name: basename.to_string(),
            parent: Some(parent_id),
            kind: NodeKind::Directory {
                uid,
                gid,
                mode,
                atime: now,
                mtime: now,
                ctime: now,
                children: BTreeMap::new(),
            },
        });
        self.insert_child(parent_id, basename.to_string(), id);
        self.save()?;
        Ok(self.snapshot(id))
    }

    pub fn unlink(&mut self, path: &str) -> Result<()> {
        let id = self.resolve(path)?;
        let node = &self.arena[id];
        if !matches!(node.kind, NodeKind::File) {
            return Err(Error::NotFound(path.to_string()));
        }
        let parent_id = node
            .parent
            .ok_or_else(|| Error::InvalidPath("cannot unlink root".to_string()))?;
        let name = node.name.clone();

        if let NodeKind::Directory { children, .. } = &mut self.arena[parent_id].kind {
            children.remove(&name);
        }
        self.save()
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let id = self.resolve(path)?;
        let node = &self.arena[id];

        let empty = match &node.kind {
            NodeKind::Directory { children, .. } => children.is_empty(),
            NodeKind::File => return Err(Error::NotADirectory(path.to_string())),
        };
        if !empty {
            return Err(Error::DirectoryNotEmpty(path.to_string()));
        }

        let parent_id = node
            .parent
            .ok_or_else(|| Error::InvalidPath("cannot remove root".to_string()))?;
        let name = node.name.clone();

        if let NodeKind::Directory { children, .. } = &mut self.arena[parent_id].kind {
            children.remove(&name);
        }
        self.save()
    }

    pub fn children_of(&self, path: &str) -> Result<Vec<String>> {
        let id = self.resolve(path)?;
        match &self.arena[id].kind {
            NodeKind::Directory { children, .. } => Ok(children.keys().cloned().collect()),
            NodeKind::File => Err(Error::NotADirectory(path.to_string())),
        }
    }

    pub fn set_dir_mode(&mut self, path: &str, mode: u32) -> Result<()> {
        let id = self.resolve(path)?;
        match &mut self.arena[id].kind {
            NodeKind::Directory { mode: stored, .. } => *stored = mode,
            NodeKind::File => return Err(Error::NotADirectory(path.to_string())),
        }
        self.save()
    }

    pub fn set_dir_owner(&mut self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let id = self.resolve(path)?;
        match &mut self.arena[id].kind {
            NodeKind::Directory {
                uid: stored_uid,
                gid: stored_gid,
                ..
            } => {
                *stored_uid = uid;
                *stored_gid = gid;
            }
            NodeKind::File => return Err(Error::NotADirectory(path.to_string())),
        }
        self.save()
    }

    fn resolve(&self, path: &str) -> Result<NodeId> {
        let components = split_path(path)?;
        let mut current = ROOT;
        for comp in components {
            current = self.child_of(current, comp, path)?;
        }
        Ok(current)
    }

    fn resolve_parent<'p>(&self, path: &'p str) -> Result<(NodeId, &'p str)> {
        let components = split_path(path)?;
        let (parent_components, basename) = components
            .split_last()
            .map(|(last, rest)| (rest, *last))
            .ok_or_else(|| Error::InvalidPath(path.to_string()))?;

        let mut current = ROOT;
        for comp in parent_components {
            current = self.child_of(current, comp, path)?;
        }

        match &self.arena[current].kind {
            NodeKind::Directory { .. } => Ok((current, basename)),
            NodeKind::File => Err(Error::NotADirectory(path.to_string())),
        }
    }

    fn child_of(&self, id: NodeId, name: &str, path: &str) -> Result<NodeId> {
        match &self.arena[id].kind {
            NodeKind::Directory { children, .. } => children
                .get(name)
                .copied()
                .ok_or_else(|| Error::NotFound(path.to_string())),
            NodeKind::File => Err(Error::NotFound(path.to_string())),
        }
    }

    fn ensure_name_free(&self, parent_id: NodeId, basename: &str, path: &str) -> Result<()> {
        if let NodeKind::Directory { children, .. } = &self.arena[parent_id].kind {
            if children.contains_key(basename) {
                return Err(Error::AlreadyExists(path.to_string()));
            }
        }
        Ok(())
    }

    fn insert_child(&mut self, parent_id: NodeId, name: String, id: NodeId) {
        if let NodeKind::Directory { children, .. } = &mut self.arena[parent_id].kind {
            children.insert(name, id);
        }
    }

    fn fresh_opaque_name(&self) -> String {
        loop {
            let candidate = utils::random_opaque_name();
            let taken = self
                .arena
                .iter()
                .any(|node| matches!(node.kind, NodeKind::File) && node.opaque_name == candidate);
            if !taken {
                return candidate;
            }
        }
    }

    fn snapshot(&self, id: NodeId) -> Entry {
        let node = &self.arena[id];
        match &node.kind {
            NodeKind::File => Entry::File {
                name: node.name.clone(),
                opaque_name: node.opaque_name.clone(),
            },
            NodeKind::Directory {
                uid,
                gid,
                mode,
                atime,
                mtime,
                ctime,
                children,
            } => {
                let num_subdirs = children
                    .values()
                    .filter(|&&child_id| matches!(self.arena[child_id].kind, NodeKind::Directory { .. }))
                    .count();
                Entry::Directory {
                    name: node.name.clone(),
                    opaque_name: node.opaque_name.clone(),
                    uid: *uid,
                    gid: *gid,
                    mode: *mode,
                    atime: *atime,
                    mtime: *mtime,
                    ctime: *ctime,
                    num_subdirs,
                }
            }
        }
    }

    fn to_codec_entry(&self, id: NodeId) -> codec::Entry {
        let node = &self.arena[id];
        match &node.kind {
            NodeKind::File => codec::Entry::File {
                name: node.name.clone(),
                opaque_name: node.opaque_name.clone(),
            },
            NodeKind::Directory {
                uid,
                gid,
                mode,
                atime,
                mtime,
                ctime,
                children,
            } => codec::Entry::Directory {
                name: node.name.clone(),
                opaque_name: node.opaque_name.clone(),
                uid: *uid,
                gid: *gid,
                mode: *mode,
                atime: *atime,
                mtime: *mtime,
                ctime: *ctime,
                children: children.values().map(|&id| self.to_codec_entry(id)).collect(),
            },
        }
    }

    fn save(&self) -> Result<()> {
        let tree = self.to_codec_entry(ROOT);
        let mut plaintext = Vec::new();
        codec::encode_entry(&mut plaintext, &tree)?;
        let sealed = envelope::seal(&plaintext, &self.password)?;

        // Write-temp-then-rename: the database either holds the previous
        // generation whole, or the new one whole, never a torn mix.
        let tmp_path = self.db_path.with_extension("tmp");
        fs::write(&tmp_path, &sealed)?;
        fs::rename(&tmp_path, &self.db_path)?;
        trace!("index: saved database at {}", self.db_path.display());
        Ok(())
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(path.split('/').filter(|c| !c.is_empty()).collect())
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn build_arena(entry: codec::Entry, parent: Option<NodeId>, arena: &mut Vec<Node>) -> NodeId {
    match entry {
        codec::Entry::File { name, opaque_name } => {
            let id = arena.len();
            arena.push(Node {
                name,
                opaque_name,
                parent,
                kind: NodeKind::File,
            });
            id
        }
        codec::Entry::Directory {
            name,
            opaque_name,
            uid,
            gid,
            mode,
            atime,
            mtime,
            ctime,
            children,
        } => {
            let id = arena.len();
            arena.push(Node {
                name,
                opaque_name,
                parent,
                kind: NodeKind::Directory {
                    uid,
                    gid,
                    mode,
                    atime,
                    mtime,
                    ctime,
                    children: BTreeMap::new(),
                },
            });
            for child in children {
                let child_name = child.name().to_string();
                let child_id = build_arena(child, Some(id), arena);
                if let NodeKind::Directory { children: map, .. } = &mut arena[id].kind {
                    map.insert(child_name, child_id);
                }
            }
            id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh_index() -> (tempfile::TempDir, Index) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("obfusfs.db");
        let index = Index::load_or_create(db_path, b"hunter2".to_vec()).unwrap();
        (dir, index)
    }

    /// For every directory `d` and name `n` with `d.children[n] == e`,
    /// `e.parent == d` (spec invariant 5).
    fn assert_tree_invariant(index: &Index) {
        for (id, node) in index.arena.iter().enumerate() {
            if let NodeKind::Directory { children, .. } = &node.kind {
                for (name, &child_id) in children {
                    let child = &index.arena[child_id];
                    assert_eq!(&child.name, name);
                    assert_eq!(child.parent, Some(id));
                }
            }
        }
    }

    #[test]
    fn fresh_index_has_an_empty_root() {
        let (_dir, index) = fresh_index();
        assert_eq!(index.children_of("/").unwrap(), Vec::<String>::new());
        assert_tree_invariant(&index);
    }

    #[test]
    fn create_file_then_get_round_trips() {
        let (_dir, mut index) = fresh_index();
        index.mkdir("/a", 1000, 1000, 0o755).unwrap();
        let entry = index.create_file("/a/b.txt").unwrap();
        let opaque = entry.opaque_name().to_string();
        assert_eq!(opaque.len(), 64);

        match index.get("/a/b.txt").unwrap() {
            Entry::File { name, opaque_name } => {
                assert_eq!(name, "b.txt");
                assert_eq!(opaque_name, opaque);
            }
            Entry::Directory { .. } => panic!("expected a file"),
        }
        assert_tree_invariant(&index);
    }

    #[test]
    fn create_file_rejects_duplicate_names() {
        let (_dir, mut index) = fresh_index();
        index.create_file("/a").unwrap();
        assert!(matches!(index.create_file("/a"), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn create_file_rejects_missing_parent() {
        let (_dir, mut index) = fresh_index();
        assert!(matches!(
            index.create_file("/missing/b.txt"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn opaque_names_are_unique_across_many_files() {
        let (_dir, mut index) = fresh_index();
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            let entry = index.create_file(&format!("/f{i}")).unwrap();
            assert!(seen.insert(entry.opaque_name().to_string()));
        }
    }

    #[test]
    fn unlink_removes_the_file() {
        let (_dir, mut index) = fresh_index();
        index.create_file("/a.txt").unwrap();
        index.unlink("/a.txt").unwrap();
        assert!(matches!(index.get("/a.txt"), Err(Error::NotFound(_))));
    }

    #[test]
    fn unlink_rejects_root() {
        let (_dir, mut index) = fresh_index();
        assert!(index.unlink("/").is_err());
    }

    #[test]
    fn rmdir_rejects_nonempty_directory() {
        let (_dir, mut index) = fresh_index();
        index.mkdir("/x", 0, 0, 0o755).unwrap();
        index.mkdir("/x/y", 0, 0, 0o755).unwrap();

        assert!(matches!(index.rmdir("/x"), Err(Error::DirectoryNotEmpty(_))));
        assert!(index.get("/x").is_ok());
        assert!(index.get("/x/y").is_ok());
    }

    #[test]
    fn rmdir_succeeds_once_empty() {
        let (_dir, mut index) = fresh_index();
        index.mkdir("/x", 0, 0, 0o755).unwrap();
        index.rmdir("/x").unwrap();
        assert!(matches!(index.get("/x"), Err(Error::NotFound(_))));
    }

    #[test]
    fn reloading_yields_an_equal_tree() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("obfusfs.db");

        let mut index = Index::load_or_create(&db_path, b"hunter2".to_vec()).unwrap();
        index.mkdir("/a", 1, 2, 0o750).unwrap();
        index.create_file("/a/b.txt").unwrap();

        let reloaded = Index::load_or_create(&db_path, b"hunter2".to_vec()).unwrap();
        assert_eq!(reloaded.children_of("/").unwrap(), index.children_of("/").unwrap());
        assert_eq!(
            reloaded.children_of("/a").unwrap(),
            index.children_of("/a").unwrap()
        );
        assert_tree_invariant(&reloaded);
    }

    #[test]
    fn reloading_with_wrong_password_fails_auth() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("obfusfs.db");
        Index::load_or_create(&db_path, b"hunter2".to_vec()).unwrap();

        assert!(matches!(
            Index::load_or_create(&db_path, b"wrong".to_vec()),
            Err(Error::Auth)
        ));
    }

    #[test]
    fn children_of_rejects_a_file_path() {
        let (_dir, mut index) = fresh_index();
        index.create_file("/a.txt").unwrap();
        assert!(matches!(
            index.children_of("/a.txt"),
            Err(Error::NotADirectory(_))
        ));
    }
}
