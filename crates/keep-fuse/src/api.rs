//! Metadata API client boundary
//!
//! The filesystem only needs three queries: tag links, groups, and the
//! contents of one group. `MemoryApi` answers them from an in-memory
//! snapshot, evaluating the same filters a remote server would.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::manifest::looks_like_locator;

pub type Result<T> = std::result::Result<T, ApiError>;

pub const COLLECTION_KIND: &str = "arvados#collection";
pub const GROUP_KIND: &str = "arvados#group";
pub const LINK_KIND: &str = "arvados#link";
pub const USER_KIND: &str = "arvados#user";

static UUID_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]{5}-[a-z0-9]{5}-[a-z0-9]{15}").expect("valid regex")
});

/// True if `s` starts like a metadata object uuid (`zzzzz-xxxxx-...`).
pub fn looks_like_uuid(s: &str) -> bool {
    UUID_SHAPE.is_match(s)
}

/// Object kind of an identifier: collections by locator or by the `4zz18`
/// uuid infix, other kinds by their infix.
pub fn object_kind(id: &str) -> Option<&'static str> {
    if looks_like_locator(id) {
        return Some(COLLECTION_KIND);
    }
    if !looks_like_uuid(id) {
        return None;
    }
    match &id[6..11] {
        "4zz18" => Some(COLLECTION_KIND),
        "j7d0g" => Some(GROUP_KIND),
        "o0j2j" => Some(LINK_KIND),
        "tpzed" => Some(USER_KIND),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single list filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `field = value`
    Eq { field: String, value: String },
    /// `field is_a kind`, where the field holds an object identifier
    IsA { field: String, kind: String },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_a(field: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::IsA {
            field: field.into(),
            kind: kind.into(),
        }
    }

    pub fn matches(&self, object: &Value) -> bool {
        match self {
            Filter::Eq { field, value } => {
                object.get(field).and_then(Value::as_str) == Some(value.as_str())
            }
            Filter::IsA { field, kind } => object
                .get(field)
                .and_then(Value::as_str)
                .and_then(object_kind)
                .is_some_and(|k| k == kind.as_str()),
        }
    }
}

/// Filters, field selection and distinct flag for a list call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub filters: Vec<Filter>,
    pub select: Vec<String>,
    pub distinct: bool,
}

impl ListRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn select(mut self, fields: &[&str]) -> Self {
        self.select.extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Link {
    pub uuid: String,
    pub link_class: String,
    pub name: String,
    pub head_uuid: String,
    pub tail_uuid: String,
}

impl Link {
    pub fn tag(name: impl Into<String>, head_uuid: impl Into<String>) -> Self {
        Self {
            link_class: "tag".into(),
            name: name.into(),
            head_uuid: head_uuid.into(),
            ..Default::default()
        }
    }

    /// A `name` link giving `head_uuid` a display name inside a group.
    pub fn name(name: impl Into<String>, head_uuid: impl Into<String>) -> Self {
        Self {
            link_class: "name".into(),
            name: name.into(),
            head_uuid: head_uuid.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    pub uuid: String,
    pub name: String,
    pub group_class: Option<String>,
}

impl Group {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            group_class: None,
        }
    }
}

/// Items owned by a group plus the links naming them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupContents {
    pub items: Vec<Value>,
    pub links: Vec<Link>,
}

/// Read-only queries against the metadata service.
pub trait MetadataApi: Send + Sync {
    fn links(&self, request: &ListRequest) -> Result<Vec<Link>>;
    fn groups(&self, request: &ListRequest) -> Result<Vec<Group>>;
    fn group_contents(&self, uuid: &str) -> Result<GroupContents>;
}

/// Everything `MemoryApi` serves. This is also the on-disk JSON format read
/// by [`MemoryApi::load_json`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub links: Vec<Link>,
    pub groups: Vec<Group>,
    pub contents: HashMap<String, GroupContents>,
}

#[derive(Default)]
pub struct MemoryApi {
    snapshot: RwLock<Snapshot>,
    queries: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
            ..Default::default()
        }
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&text)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn add_link(&self, link: Link) {
        self.snapshot.write().links.push(link);
    }

    /// Remove every link matching `pred`, returning how many were removed.
    pub fn remove_links(&self, pred: impl Fn(&Link) -> bool) -> usize {
        let mut snapshot = self.snapshot.write();
        let before = snapshot.links.len();
        snapshot.links.retain(|l| !pred(l));
        before - snapshot.links.len()
    }

    pub fn add_group(&self, group: Group) {
        self.snapshot.write().groups.push(group);
    }

    pub fn remove_group(&self, uuid: &str) {
        self.snapshot.write().groups.retain(|g| g.uuid != uuid);
    }

    pub fn set_contents(&self, uuid: impl Into<String>, contents: GroupContents) {
        self.snapshot.write().contents.insert(uuid.into(), contents);
    }

    /// Number of queries served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// While offline every query fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn begin_query(&self) -> Result<()> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::Transport("metadata API is offline".into()));
        }
        Ok(())
    }
}

impl MetadataApi for MemoryApi {
    fn links(&self, request: &ListRequest) -> Result<Vec<Link>> {
        self.begin_query()?;
        apply_request(&self.snapshot.read().links, request)
    }

    fn groups(&self, request: &ListRequest) -> Result<Vec<Group>> {
        self.begin_query()?;
        apply_request(&self.snapshot.read().groups, request)
    }

    fn group_contents(&self, uuid: &str) -> Result<GroupContents> {
        self.begin_query()?;
        self.snapshot
            .read()
            .contents
            .get(uuid)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(uuid.to_string()))
    }
}

/// Filter, project and optionally dedupe rows the way the list endpoints do.
fn apply_request<T: Serialize + DeserializeOwned>(
    rows: &[T],
    request: &ListRequest,
) -> Result<Vec<T>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        let value = serde_json::to_value(row)?;
        if !request.filters.iter().all(|f| f.matches(&value)) {
            continue;
        }
        let value = project(value, &request.select);
        if request.distinct && !seen.insert(value.to_string()) {
            continue;
        }
        out.push(serde_json::from_value(value)?);
    }
    Ok(out)
}

fn project(value: Value, select: &[String]) -> Value {
    if select.is_empty() {
        return value;
    }
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| select.iter().any(|s| s == k))
                .collect(),
        ),
        other => other,
    }
}
