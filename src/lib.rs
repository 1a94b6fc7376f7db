//! Library interface for casket
//!
//! Validates cask manifests and drives the install lifecycle
//! (fetch → verify → stage → install → record) so that a crash or
//! cancellation never leaves a partially installed application recorded as
//! installed.

pub mod cancel;
pub mod controller;
pub mod download;
pub mod error;
pub mod extract;
pub mod layout;
pub mod ledger;
pub mod manifest;
pub mod verify;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use controller::{Controller, InstallOutcome, InstallState, RepairOutcome, UninstallOutcome};
pub use download::{Fetcher, HttpFetcher};
pub use error::{CasketError, IntegrityError, Result, Stage, ValidationError};
pub use extract::{ArchiveStager, Stager};
pub use layout::Layout;
pub use ledger::{FileLedger, InstalledRecord, Ledger, MemoryLedger};
pub use manifest::Manifest;
