//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async queries that
//! accept any Postgres executor (`&PgPool` or `&mut PgConnection` inside a
//! transaction) as the first argument. Repositories never retry; callers
//! wrap them in [`with_commit_retry`](crate::commit::with_commit_retry).

pub mod chunk_repo;
pub mod job_repo;

pub use chunk_repo::ChunkRepo;
pub use job_repo::JobRepo;
