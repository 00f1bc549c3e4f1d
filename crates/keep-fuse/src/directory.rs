//! Directory refresh and the freshness-checked access primitives.
//!
//! Every read of a directory's entries goes through `contains`, `get_child`,
//! `names` or `items`, each of which refreshes a stale directory first. The
//! per-kind `update` builds a complete new entry map before swapping it in,
//! reusing child inodes whose identity is unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::api::{ApiError, COLLECTION_KIND, Filter, ListRequest, MetadataApi, looks_like_uuid};
use crate::error::FsError;
use crate::file::{ObjectFile, StreamFile};
use crate::inode::InodeTable;
use crate::keep::KeepClient;
use crate::manifest::looks_like_locator;
use crate::node::{DirectoryKind, DirectoryNode, FileKind, FileNode, Freshness, Node};

/// The remote services directories refresh from.
#[derive(Clone)]
pub struct Backend {
    pub keep: Arc<dyn KeepClient>,
    pub api: Arc<dyn MetadataApi>,
}

impl Backend {
    pub fn new(keep: Arc<dyn KeepClient>, api: Arc<dyn MetadataApi>) -> Self {
        Self { keep, api }
    }
}

/// Turn a remote name into a usable directory entry name.
fn entry_name(raw: &str) -> Option<String> {
    match raw {
        "" | "." | ".." => None,
        _ => Some(raw.replace(['/', '\0'], "_")),
    }
}

impl InodeTable {
    /// Refresh `ino` if it is stale.
    pub fn refresh(&mut self, backend: &Backend, ino: u64) -> Result<(), FsError> {
        if self.dir(ino)?.is_stale(Instant::now()) {
            self.update(backend, ino)?;
        }
        Ok(())
    }

    /// Recompute the entries of `ino` from its data source.
    ///
    /// Metadata API failures are logged and leave the current entries in
    /// place; the directory is still stamped fresh so the next notification
    /// or poll retries. A collection that cannot be resolved stays stale and
    /// the error is returned.
    pub fn update(&mut self, backend: &Backend, ino: u64) -> Result<(), FsError> {
        let dir = self.dir(ino)?;
        let kind = dir.kind.clone();
        let freshness = dir.freshness();
        debug!("update: ino={ino} kind={kind:?}");

        let rebuilt = match &kind {
            DirectoryKind::Plain | DirectoryKind::Magic => Ok(None),
            DirectoryKind::Collection { locator } => {
                self.load_collection(backend, ino, locator)?;
                Ok(None)
            }
            DirectoryKind::Tags => {
                self.rebuild_tags(backend.api.as_ref(), ino, freshness).map(Some)
            }
            DirectoryKind::Tag { tag } => {
                self.rebuild_tag(backend.api.as_ref(), ino, tag).map(Some)
            }
            DirectoryKind::Groups => {
                self.rebuild_groups(backend.api.as_ref(), ino, freshness).map(Some)
            }
            DirectoryKind::Group { uuid } => self.rebuild_group(backend, ino, uuid).map(Some),
        };

        let dir = self.dir_mut(ino)?;
        match rebuilt {
            Ok(Some(entries)) => dir.entries = entries,
            Ok(None) => {}
            Err(e) => warn!("refresh of inode {ino} ({kind:?}) failed, keeping old entries: {e}"),
        }
        dir.mark_fresh();
        Ok(())
    }

    /// Mark `ino` stale, passing the invalidation on to child directories for
    /// the kinds that cascade.
    pub fn invalidate(&mut self, ino: u64) {
        let children: Vec<u64> = match self.dir_mut(ino) {
            Ok(dir) => {
                dir.invalidate();
                if !dir.kind.cascades() {
                    return;
                }
                dir.entries.values().copied().collect()
            }
            Err(_) => return,
        };
        for child in children {
            if matches!(self.get(child), Ok(Node::Directory(_))) {
                self.invalidate(child);
            }
        }
    }

    /// Membership test. A magic directory probes storage for names it has
    /// not materialized yet; the probe result is not cached.
    pub fn contains(&mut self, backend: &Backend, ino: u64, name: &str) -> Result<bool, FsError> {
        self.refresh(backend, ino)?;
        let dir = self.dir(ino)?;
        if dir.entries.contains_key(name) {
            return Ok(true);
        }
        if dir.kind != DirectoryKind::Magic {
            return Ok(false);
        }
        match backend.keep.get(name) {
            Ok(_) => Ok(true),
            Err(e) => {
                trace!("magic probe for {name:?} failed: {e}");
                Ok(false)
            }
        }
    }

    /// Child inode by name. A magic directory materializes a collection
    /// directory for any name it has not seen before.
    pub fn get_child(&mut self, backend: &Backend, ino: u64, name: &str) -> Result<u64, FsError> {
        self.refresh(backend, ino)?;
        let dir = self.dir(ino)?;
        if let Some(&child) = dir.entries.get(name) {
            return Ok(child);
        }
        if dir.kind != DirectoryKind::Magic {
            return Err(FsError::not_found(name));
        }
        debug!("magic: materializing collection {name:?} under inode {ino}");
        let child = self.add(Node::Directory(DirectoryNode::new(
            ino,
            DirectoryKind::Collection {
                locator: name.to_string(),
            },
            Freshness::Push,
        )));
        self.dir_mut(ino)?.entries.insert(name.to_string(), child);
        Ok(child)
    }

    /// `contains` followed by `get_child`.
    pub fn child(
        &mut self,
        backend: &Backend,
        ino: u64,
        name: &str,
    ) -> Result<Option<u64>, FsError> {
        if !self.contains(backend, ino, name)? {
            return Ok(None);
        }
        self.get_child(backend, ino, name).map(Some)
    }

    pub fn names(&mut self, backend: &Backend, ino: u64) -> Result<Vec<String>, FsError> {
        self.refresh(backend, ino)?;
        Ok(self.dir(ino)?.entries.keys().cloned().collect())
    }

    /// All `(name, inode)` pairs, sorted by name.
    pub fn items(&mut self, backend: &Backend, ino: u64) -> Result<Vec<(String, u64)>, FsError> {
        self.refresh(backend, ino)?;
        let mut items: Vec<(String, u64)> = self
            .dir(ino)?
            .entries
            .iter()
            .map(|(name, child)| (name.clone(), *child))
            .collect();
        items.sort();
        Ok(items)
    }

    fn load_collection(
        &mut self,
        backend: &Backend,
        ino: u64,
        locator: &str,
    ) -> Result<(), FsError> {
        let manifest = backend.keep.resolve(locator)?;
        for stream in manifest.streams() {
            let mut cwd = ino;
            for part in stream.name().split('/') {
                cwd = self.ensure_subdir(cwd, part)?;
            }
            for file in stream.files() {
                let mut parts: Vec<&str> = file.name().split('/').collect();
                let Some(leaf) = parts.pop().and_then(entry_name) else {
                    continue;
                };
                let mut dir = cwd;
                for part in parts {
                    dir = self.ensure_subdir(dir, part)?;
                }
                let node = FileNode::new(
                    dir,
                    FileKind::Stream(StreamFile::new(stream.segments(file), backend.keep.clone())),
                );
                let child = self.add(Node::File(node));
                self.dir_mut(dir)?.entries.insert(leaf, child);
            }
        }
        debug!(
            "collection {locator} loaded: {} streams",
            manifest.streams().len()
        );
        Ok(())
    }

    /// The plain subdirectory `name` of `parent`, created if missing. Empty
    /// and `.` segments resolve to `parent` itself.
    fn ensure_subdir(&mut self, parent: u64, name: &str) -> Result<u64, FsError> {
        let Some(name) = entry_name(name) else {
            return Ok(parent);
        };
        if let Some(&existing) = self.dir(parent)?.entries.get(&name) {
            if self.get(existing)?.is_dir() {
                return Ok(existing);
            }
        }
        let child = self.add(Node::Directory(DirectoryNode::plain(parent)));
        self.dir_mut(parent)?.entries.insert(name, child);
        Ok(child)
    }

    /// Reuse the old child under `name` when `same` accepts it, else create
    /// one with `make`.
    fn reuse_or_add(
        &mut self,
        old: &HashMap<String, u64>,
        name: &str,
        same: impl Fn(&Node) -> bool,
        make: impl FnOnce() -> Option<Node>,
    ) -> Option<u64> {
        if let Some(&existing) = old.get(name) {
            if self.get(existing).is_ok_and(same) {
                return Some(existing);
            }
        }
        make().map(|node| self.add(node))
    }

    fn rebuild_tags(
        &mut self,
        api: &dyn MetadataApi,
        ino: u64,
        freshness: Freshness,
    ) -> Result<HashMap<String, u64>, ApiError> {
        let request = ListRequest::new()
            .filter(Filter::eq("link_class", "tag"))
            .select(&["name"])
            .distinct();
        let links = api.links(&request)?;
        let old = self.cached(ino);
        let mut entries = HashMap::new();
        for link in links {
            let Some(name) = entry_name(&link.name) else {
                continue;
            };
            let tag = link.name;
            let child = self.reuse_or_add(
                &old,
                &name,
                |_| true,
                || {
                    Some(Node::Directory(DirectoryNode::new(
                        ino,
                        DirectoryKind::Tag { tag },
                        freshness,
                    )))
                },
            );
            entries.extend(child.map(|c| (name, c)));
        }
        Ok(entries)
    }

    fn rebuild_tag(
        &mut self,
        api: &dyn MetadataApi,
        ino: u64,
        tag: &str,
    ) -> Result<HashMap<String, u64>, ApiError> {
        let request = ListRequest::new()
            .filter(Filter::eq("link_class", "tag"))
            .filter(Filter::eq("name", tag))
            .filter(Filter::is_a("head_uuid", COLLECTION_KIND))
            .select(&["head_uuid"]);
        let links = api.links(&request)?;
        let old = self.cached(ino);
        let mut entries = HashMap::new();
        for link in links {
            let Some(name) = entry_name(&link.head_uuid) else {
                continue;
            };
            let head = link.head_uuid;
            let child = self.reuse_or_add(
                &old,
                &name,
                |node| node.remote_id() == Some(head.as_str()),
                || Some(collection_dir(ino, head.clone())),
            );
            entries.extend(child.map(|c| (name, c)));
        }
        Ok(entries)
    }

    fn rebuild_groups(
        &mut self,
        api: &dyn MetadataApi,
        ino: u64,
        freshness: Freshness,
    ) -> Result<HashMap<String, u64>, ApiError> {
        let groups = api.groups(&ListRequest::new())?;
        let old = self.cached(ino);
        let mut entries = HashMap::new();
        for group in groups {
            let raw = if group.name.is_empty() {
                &group.uuid
            } else {
                &group.name
            };
            let Some(name) = entry_name(raw) else {
                continue;
            };
            let uuid = group.uuid;
            let child = self.reuse_or_add(
                &old,
                &name,
                |node| node.remote_id() == Some(uuid.as_str()),
                || {
                    Some(Node::Directory(DirectoryNode::new(
                        ino,
                        DirectoryKind::Group { uuid: uuid.clone() },
                        freshness,
                    )))
                },
            );
            entries.extend(child.map(|c| (name, c)));
        }
        Ok(entries)
    }

    fn rebuild_group(
        &mut self,
        backend: &Backend,
        ino: u64,
        uuid: &str,
    ) -> Result<HashMap<String, u64>, ApiError> {
        let contents = backend.api.group_contents(uuid)?;
        let link_names: HashMap<&str, &str> = contents
            .links
            .iter()
            .map(|l| (l.head_uuid.as_str(), l.name.as_str()))
            .collect();

        let old = self.cached(ino);
        let mut entries = HashMap::new();
        for item in &contents.items {
            let Some(item_uuid) = item.get("uuid").and_then(Value::as_str) else {
                continue;
            };
            let raw = link_names
                .get(item_uuid)
                .copied()
                .or_else(|| item.get("name").and_then(Value::as_str).filter(|n| !n.is_empty()))
                .unwrap_or(item_uuid);
            let Some(name) = entry_name(raw) else {
                continue;
            };
            let child = self.reuse_or_add(
                &old,
                &name,
                |node| node.remote_id() == Some(item_uuid),
                || classify_item(ino, item_uuid, item),
            );
            match child {
                Some(c) => {
                    entries.insert(name, c);
                }
                None => trace!("group {uuid}: dropping unrecognized item {item_uuid}"),
            }
        }
        Ok(entries)
    }

    fn cached(&self, ino: u64) -> HashMap<String, u64> {
        self.dir(ino)
            .map(|d| d.entries.clone())
            .unwrap_or_default()
    }
}

fn collection_dir(parent: u64, locator: String) -> Node {
    Node::Directory(DirectoryNode::new(
        parent,
        DirectoryKind::Collection { locator },
        Freshness::Push,
    ))
}

/// Group items become collection directories when their identifier looks
/// like a locator, JSON files when it looks like an object uuid, and are
/// dropped otherwise.
fn classify_item(parent: u64, item_uuid: &str, item: &Value) -> Option<Node> {
    if looks_like_locator(item_uuid) {
        return Some(collection_dir(parent, item_uuid.to_string()));
    }
    if looks_like_uuid(item_uuid) {
        return Some(Node::File(FileNode::new(
            parent,
            FileKind::Object(ObjectFile::from_item(item_uuid, item)),
        )));
    }
    None
}
