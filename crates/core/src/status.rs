//! Status enums mapping to SMALLINT lookup tables, plus the job and chunk
//! state machines.
//!
//! Each enum variant's discriminant matches the seed data order (1-based)
//! in the corresponding `*_statuses` database table.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Status ID type matching SMALLINT/SMALLSERIAL in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Resolve a database status ID, `None` for unknown values.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Lowercase name matching the lookup table's `name` column.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $label, )+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl TryFrom<StatusId> for $name {
            type Error = CoreError;

            fn try_from(id: StatusId) -> Result<Self, Self::Error> {
                $name::from_id(id).ok_or_else(|| {
                    CoreError::Validation(format!(
                        "Unknown {} id: {id}",
                        stringify!($name)
                    ))
                })
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_status_enum! {
    /// Job lifecycle status.
    JobStatus {
        Pending = 1 => "pending",
        Processing = 2 => "processing",
        Completed = 3 => "completed",
        Failed = 4 => "failed",
        Cancelled = 5 => "cancelled",
    }
}

define_status_enum! {
    /// Chunk execution status.
    ChunkStatus {
        Queued = 1 => "queued",
        Running = 2 => "running",
        RetryWait = 3 => "retry_wait",
        Succeeded = 4 => "succeeded",
        Failed = 5 => "failed",
        Cancelled = 6 => "cancelled",
    }
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the job state machine permits `self -> next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl ChunkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChunkStatus::Succeeded | ChunkStatus::Failed | ChunkStatus::Cancelled
        )
    }

    /// Whether the chunk state machine permits `self -> next`.
    ///
    /// `Running -> Queued` is the lease-expiry path: a worker vanished
    /// mid-attempt and the chunk goes back on the queue.
    pub fn can_transition_to(self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Succeeded)
                | (Running, RetryWait)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Queued)
                | (RetryWait, Queued)
                | (RetryWait, Cancelled)
        )
    }
}

// ---------------------------------------------------------------------------
// FailureCause
// ---------------------------------------------------------------------------

/// Why a job ended in `failed`.
///
/// Status responses surface this so callers can tell a processing failure
/// apart from an infrastructure failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// Too many chunks failed (threshold abort or nothing succeeded).
    ChunkFailures,
    /// All chunks finished but the results could not be reassembled.
    Reassembly,
    /// The store could not durably record state.
    Durability,
}

impl FailureCause {
    /// String representation for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::ChunkFailures => "chunk_failures",
            FailureCause::Reassembly => "reassembly",
            FailureCause::Durability => "durability",
        }
    }

    /// Parse from the stored string, `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chunk_failures" => Some(FailureCause::ChunkFailures),
            "reassembly" => Some(FailureCause::Reassembly),
            "durability" => Some(FailureCause::Durability),
            _ => None,
        }
    }

    /// `true` when the failure came from infrastructure, not processing logic.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, FailureCause::Durability)
    }
}
