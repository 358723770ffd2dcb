//! ドメイン識別子（強い型付けの ID）
//!
//! 二つの系統があります:
//! - `Id<T>`: [`IdGenerator`](crate::ports::IdGenerator) が発行する ULID ベースの ID。
//!   マーカー型 `T` は `PhantomData` なので、`JobId` と `TaskId` は 16 バイトのまま取り違えられません。
//! - 名前の newtype（`JobName`, `StreamId`, ...）: 運用者が選ぶ安定した identity で、再 deploy をまたいで残る。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait giving each id family its display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID id. Serialized as the bare ULID string.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// Marker types
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lease {}

impl IdMarker for Lease {
    fn prefix() -> &'static str {
        "lease-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Cutover {}

impl IdMarker for Cutover {
    fn prefix() -> &'static str {
        "cutover-"
    }
}

/// Identifier of one deployed job definition (unique per config version).
pub type JobId = Id<Job>;

/// Identifier of a Task (one schedulable unit of work).
pub type TaskId = Id<Task>;

/// Opaque lease token handed to the claiming worker. Fencing compares it byte-for-byte.
pub type LeaseToken = Id<Lease>;

/// Identifier of a staged (pending) cutover.
pub type CutoverId = Id<Cutover>;

// ========================================
// Name newtypes
// ========================================

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }
    };
}

name_type!(
    /// Logical job name; stable across config versions.
    JobName
);
name_type!(
    /// Identity of an event stream (a job output or a schedulable source).
    StreamId
);
name_type!(
    /// Logical dataset name.
    DatasetName
);
name_type!(
    /// Executor process identity recorded as the lease holder.
    WorkerId
);
name_type!(
    /// Logical name of an active pointer (e.g. `analytics.events.current`).
    PointerName
);
name_type!(
    /// Content-derived identity of a published dataset version.
    VersionId
);

/// Monotonic configuration version assigned at deploy time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigVersion(pub u64);

impl fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let ulid1 = Ulid::new();
        let ulid2 = Ulid::new();

        let job = JobId::from_ulid(ulid1);
        let task = TaskId::from_ulid(ulid2);

        assert_eq!(job.as_ulid(), ulid1);
        assert_eq!(task.as_ulid(), ulid2);

        assert!(job.to_string().starts_with("job-"));
        assert!(task.to_string().starts_with("task-"));
        // let _: JobId = task; // <- does not compile
    }

    #[test]
    fn ids_serialize_as_bare_ulid() {
        let ulid = Ulid::new();
        let token = LeaseToken::from_ulid(ulid);

        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, format!("\"{ulid}\""));

        let back: LeaseToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;

        assert_eq!(size_of::<JobId>(), size_of::<Ulid>());
        assert_eq!(size_of::<LeaseToken>(), 16);
    }

    #[test]
    fn name_types_are_transparent() {
        let stream = StreamId::new("raw.events");
        assert_eq!(serde_json::to_string(&stream).unwrap(), "\"raw.events\"");
        assert_eq!(stream.to_string(), "raw.events");
        assert_eq!(ConfigVersion(3).to_string(), "v3");
    }
}
