//! Namespace group assembly and validation.
//!
//! A namespace group is the complete set of segments (or segment files) for
//! one `(instance, namespace-id)` tuple: one base, one tree-index, one or
//! more contiguous primary stages, optionally a meta plus contiguous
//! secondary stages, and any number of data stages bound by embedded
//! namespace name. Data stages may also travel alone as an orphan set when
//! no base exists for the requested name.

use std::path::PathBuf;

use thiserror::Error;

use crate::header::BaseHeader;
use crate::inventory::{FileRecord, SegmentRecord};
use crate::key::{KeyClass, SegmentKey, STAGE_FLOOR};

/// Version compatibility window for base segments and base files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionWindow {
    pub min: u32,
    pub max: u32,
}

impl Default for VersionWindow {
    fn default() -> Self {
        Self { min: 10, max: 12 }
    }
}

impl VersionWindow {
    pub fn contains(&self, version: u32) -> bool {
        (self.min..=self.max).contains(&version)
    }
}

/// Which sanity rules apply to a candidate group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Live segments about to be written to files.
    Backup,
    /// Segment files about to be reconstituted.
    Restore,
}

/// Record access the grouper needs, implemented by both live segments and
/// segment files.
pub trait GroupRecord {
    fn key(&self) -> SegmentKey;
    fn raw_key(&self) -> u32;
    fn namespace(&self) -> Option<&str>;
    fn base_header(&self) -> Option<&BaseHeader>;
    fn meta_arena_count(&self) -> Option<u32>;
}

impl GroupRecord for SegmentRecord {
    fn key(&self) -> SegmentKey {
        self.key
    }
    fn raw_key(&self) -> u32 {
        self.raw_key
    }
    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
    fn base_header(&self) -> Option<&BaseHeader> {
        self.base.as_ref()
    }
    fn meta_arena_count(&self) -> Option<u32> {
        self.meta_arena_count
    }
}

impl GroupRecord for FileRecord {
    fn key(&self) -> SegmentKey {
        self.key
    }
    fn raw_key(&self) -> u32 {
        self.raw_key
    }
    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
    fn base_header(&self) -> Option<&BaseHeader> {
        self.base.as_ref()
    }
    fn meta_arena_count(&self) -> Option<u32> {
        self.meta_arena_count
    }
}

/// All members of one namespace, in the fixed operation order.
#[derive(Debug, Clone)]
pub struct NamespaceGroup<R> {
    pub namespace: String,
    pub instance: u8,
    /// `None` for an orphan data set.
    pub namespace_id: Option<u8>,
    pub base: Option<R>,
    pub tree_index: Option<R>,
    pub primary_stages: Vec<R>,
    pub meta: Option<R>,
    pub secondary_stages: Vec<R>,
    pub data_stages: Vec<R>,
}

impl<R> NamespaceGroup<R> {
    /// Members in the fixed order `[base, tree-index, primary stages, meta,
    /// secondary stages, data stages]`, skipping missing roles.
    pub fn members(&self) -> Vec<&R> {
        let mut members = Vec::with_capacity(self.len());
        members.extend(self.base.iter());
        members.extend(self.tree_index.iter());
        members.extend(self.primary_stages.iter());
        members.extend(self.meta.iter());
        members.extend(self.secondary_stages.iter());
        members.extend(self.data_stages.iter());
        members
    }

    pub fn len(&self) -> usize {
        self.base.is_some() as usize
            + self.tree_index.is_some() as usize
            + self.primary_stages.len()
            + self.meta.is_some() as usize
            + self.secondary_stages.len()
            + self.data_stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An orphan group carries data stages only.
    pub fn is_orphan(&self) -> bool {
        self.base.is_none()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupError {
    #[error("namespace '{namespace}': expected exactly one tree-index segment, found {found}")]
    TreeIndexCount { namespace: String, found: usize },
    #[error("namespace '{namespace}': no {class:?} stages found")]
    NoStages { namespace: String, class: KeyClass },
    #[error(
        "namespace '{namespace}': {class:?} stage ordinals not contiguous \
         (expected {expected:#05x}, found {found:#05x})"
    )]
    NonContiguousStages {
        namespace: String,
        class: KeyClass,
        expected: u16,
        found: u16,
    },
    #[error("namespace '{namespace}': duplicate {class:?} stage ordinal {ordinal:#05x}")]
    DuplicateStage {
        namespace: String,
        class: KeyClass,
        ordinal: u16,
    },
    #[error("namespace '{namespace}': secondary stages present without a meta segment")]
    StraySecondaryStages { namespace: String },
    #[error("namespace '{namespace}': base header unreadable or too short")]
    MissingBaseHeader { namespace: String },
    #[error("namespace '{namespace}': meta header unreadable or too short")]
    MissingMetaHeader { namespace: String },
    #[error(
        "namespace '{namespace}': base version {version} outside compatibility \
         window [{min}, {max}]"
    )]
    VersionOutOfWindow {
        namespace: String,
        version: u32,
        min: u32,
        max: u32,
    },
    #[error(
        "namespace '{namespace}': unclean server shutdown, expecting status 1, found {status}"
    )]
    UncleanShutdown { namespace: String, status: u32 },
    #[error(
        "namespace '{namespace}': {class:?} declares {declared} arenas but {found} stages found"
    )]
    ArenaCountMismatch {
        namespace: String,
        class: KeyClass,
        declared: u32,
        found: u32,
    },
    #[error("destination already holds {path}")]
    DestinationCollision { path: PathBuf },
    #[error("a live segment already carries key {key:#010x}")]
    SegmentCollision { key: u32 },
}

/// Builds every candidate group for `namespace` out of a key-sorted record
/// sequence. Falls back to an orphan data set when no base matches.
pub fn build_groups<R: GroupRecord + Clone>(
    records: &[R],
    namespace: &str,
) -> Result<Vec<NamespaceGroup<R>>, GroupError> {
    let mut groups = Vec::new();
    for record in records {
        if record.key().is_base() && record.namespace() == Some(namespace) {
            groups.push(group_for_base(records, record)?);
        }
    }
    if groups.is_empty() {
        if let Some(orphans) = orphan_data_group(records, namespace) {
            groups.push(orphans);
        }
    }
    Ok(groups)
}

/// Assembles the group around one base record.
fn group_for_base<R: GroupRecord + Clone>(
    records: &[R],
    base: &R,
) -> Result<NamespaceGroup<R>, GroupError> {
    let instance = base.key().instance;
    let namespace_id = base.key().namespace_id;
    let namespace = base.namespace().unwrap_or_default().to_string();

    let matches = |record: &&R, class: KeyClass| {
        record.key().class == class
            && record.key().instance == instance
            && record.key().namespace_id == namespace_id
    };

    let tree_indexes: Vec<&R> = records
        .iter()
        .filter(|record| matches(record, KeyClass::Primary) && record.key().is_tree_index())
        .collect();
    if tree_indexes.len() != 1 {
        return Err(GroupError::TreeIndexCount {
            namespace,
            found: tree_indexes.len(),
        });
    }

    let primary_stages = collect_stages(records, &namespace, KeyClass::Primary, |record| {
        matches(&record, KeyClass::Primary)
    })?;
    if primary_stages.is_empty() {
        return Err(GroupError::NoStages {
            namespace,
            class: KeyClass::Primary,
        });
    }

    let meta: Option<R> = records
        .iter()
        .find(|record| matches(record, KeyClass::Secondary) && record.key().is_meta())
        .cloned();

    let secondary_stages = collect_stages(records, &namespace, KeyClass::Secondary, |record| {
        matches(&record, KeyClass::Secondary)
    })?;
    if meta.is_none() && !secondary_stages.is_empty() {
        return Err(GroupError::StraySecondaryStages { namespace });
    }
    if meta.is_some() && secondary_stages.is_empty() {
        return Err(GroupError::NoStages {
            namespace,
            class: KeyClass::Secondary,
        });
    }

    let data_stages = collect_data_stages(records, instance, &namespace);

    Ok(NamespaceGroup {
        namespace,
        instance,
        namespace_id: Some(namespace_id),
        base: Some(base.clone()),
        tree_index: Some(tree_indexes[0].clone()),
        primary_stages,
        meta,
        secondary_stages,
        data_stages,
    })
}

/// Collects the stage records of one class, sorted by ordinal, enforcing
/// contiguity from the stage floor.
fn collect_stages<R: GroupRecord + Clone>(
    records: &[R],
    namespace: &str,
    class: KeyClass,
    belongs: impl Fn(&R) -> bool,
) -> Result<Vec<R>, GroupError> {
    let mut stages: Vec<R> = records
        .iter()
        .filter(|record| belongs(record) && record.key().role.is_stage())
        .cloned()
        .collect();
    stages.sort_by_key(|record| record.key().role.stage_ordinal());

    for (index, record) in stages.iter().enumerate() {
        let ordinal = record
            .key()
            .role
            .stage_ordinal()
            .expect("stage record without ordinal");
        let expected = STAGE_FLOOR + index as u16;
        if ordinal == expected {
            continue;
        }
        if index > 0 && stages[index - 1].key().role.stage_ordinal() == Some(ordinal) {
            return Err(GroupError::DuplicateStage {
                namespace: namespace.to_string(),
                class,
                ordinal,
            });
        }
        return Err(GroupError::NonContiguousStages {
            namespace: namespace.to_string(),
            class,
            expected,
            found: ordinal,
        });
    }
    Ok(stages)
}

/// Data stages are matched by instance and embedded namespace name, and
/// carry no ordering requirement.
fn collect_data_stages<R: GroupRecord + Clone>(
    records: &[R],
    instance: u8,
    namespace: &str,
) -> Vec<R> {
    records
        .iter()
        .filter(|record| {
            record.key().class == KeyClass::Data
                && record.key().instance == instance
                && record.namespace() == Some(namespace)
        })
        .cloned()
        .collect()
}

/// Degenerate group holding only the data stages for `namespace`, used when
/// no base exists for the requested name.
pub fn orphan_data_group<R: GroupRecord + Clone>(
    records: &[R],
    namespace: &str,
) -> Option<NamespaceGroup<R>> {
    let data_stages: Vec<R> = records
        .iter()
        .filter(|record| {
            record.key().class == KeyClass::Data && record.namespace() == Some(namespace)
        })
        .cloned()
        .collect();
    if data_stages.is_empty() {
        return None;
    }
    let instance = data_stages[0].key().instance;
    Some(NamespaceGroup {
        namespace: namespace.to_string(),
        instance,
        namespace_id: None,
        base: None,
        tree_index: None,
        primary_stages: Vec::new(),
        meta: None,
        secondary_stages: Vec::new(),
        data_stages,
    })
}

/// Cross-checks the declared metadata of a structurally complete group.
///
/// Backup additionally requires a clean shutdown; restore tolerates any
/// shutdown status. Orphan data groups have no metadata to check.
pub fn check_group<R: GroupRecord>(
    group: &NamespaceGroup<R>,
    window: VersionWindow,
    side: Side,
) -> Result<(), GroupError> {
    let Some(base) = &group.base else {
        return Ok(());
    };
    let namespace = group.namespace.clone();
    let Some(header) = base.base_header() else {
        return Err(GroupError::MissingBaseHeader { namespace });
    };
    if !window.contains(header.version) {
        return Err(GroupError::VersionOutOfWindow {
            namespace,
            version: header.version,
            min: window.min,
            max: window.max,
        });
    }
    if side == Side::Backup && header.shutdown_status != 1 {
        return Err(GroupError::UncleanShutdown {
            namespace,
            status: header.shutdown_status,
        });
    }
    if header.arena_count as usize != group.primary_stages.len() {
        return Err(GroupError::ArenaCountMismatch {
            namespace,
            class: KeyClass::Primary,
            declared: header.arena_count,
            found: group.primary_stages.len() as u32,
        });
    }
    if let Some(meta) = &group.meta {
        let Some(declared) = meta.meta_arena_count() else {
            return Err(GroupError::MissingMetaHeader { namespace });
        };
        if declared as usize != group.secondary_stages.len() {
            return Err(GroupError::ArenaCountMismatch {
                namespace,
                class: KeyClass::Secondary,
                declared,
                found: group.secondary_stages.len() as u32,
            });
        }
    }
    Ok(())
}

/// Fails if the destination already holds a file carrying any member key,
/// or any key under the group's instance/namespace-id.
pub fn check_destination_clear<R: GroupRecord>(
    group: &NamespaceGroup<R>,
    existing: &[FileRecord],
) -> Result<(), GroupError> {
    let member_keys: Vec<u32> = group.members().iter().map(|m| m.raw_key()).collect();
    for record in existing {
        let owned = record.key.class != KeyClass::Data
            && Some(record.key.namespace_id) == group.namespace_id
            && record.key.instance == group.instance;
        if owned || member_keys.contains(&record.raw_key) {
            return Err(GroupError::DestinationCollision {
                path: record.path.clone(),
            });
        }
    }
    Ok(())
}
