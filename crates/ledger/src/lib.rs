//! `loomerp-ledger` — tamper-evident audit ledger.
//!
//! Every mutating HTTP request appends a record to its tenant's hash chain:
//! each record binds to its predecessor via SHA-256 over canonical JSON.
//! Appends serialize per tenant through a fail-fast (`NOWAIT`) lock; the
//! verifier walks a chain segment and classifies records without mutating
//! anything.

pub mod canonical;
pub mod postgres;
pub mod record;
pub mod store;
pub mod verifier;
pub mod writer;

pub use canonical::canonical_json;
pub use postgres::PostgresChainStore;
pub use record::{AuditRecord, RecordDraft, GENESIS_HASH};
pub use store::{ChainStore, InMemoryChainStore, LedgerError};
pub use verifier::{verify_chain, VerifyReport};
pub use writer::{audit_middleware, AuditWriterConfig, AuditWriterState};
