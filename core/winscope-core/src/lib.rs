//! # winscope-core
//!
//! Project-scoped window visibility and layout restoration for i3/Sway.
//!
//! ## Design Principles
//!
//! - **Marks are the durable state**: window identity lives in window-manager
//!   marks, so the in-memory registry and audit trail can be rebuilt at any
//!   time from a tree query.
//! - **One decision function**: [`visibility::decide`] is the only place the
//!   show/hide rule exists; every trigger reaches it through
//!   [`FilteringOrchestrator`].
//! - **Synchronous**: no async runtime. The daemon drives the engine from a
//!   single event-loop thread.
//! - **Partial failure is reported, not raised**: batch operations return
//!   reports with per-item reasons; only transport failures abort a trigger.

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod launcher;
pub mod layout;
pub mod mark_store;
pub mod marks;
pub mod orchestrator;
pub mod process;
pub mod scratchpad;
pub mod testing;
pub mod tree;
pub mod visibility;

pub use audit::{AuditLog, TriggerPath, VisibilityDecision};
pub use config::{
    client_socket_path, default_daemon_socket_path, load_config, state_dir, ScopeConfig,
};
pub use engine::{EngineParts, SavedLayoutSummary, ScopeEngine, WindowClosedReport};
pub use error::{Result, ScopeError};
pub use identity::{IdentityResolver, IdentitySource, Scope, WindowIdentity};
pub use launcher::{CommandLauncher, LaunchRequest, Launcher};
pub use layout::{LayoutStore, LayoutWindowSpec, RestoreReport, SavedLayout};
pub use mark_store::{IpcSettings, MarkStore, SwayMarkStore};
pub use marks::StructuredMark;
pub use orchestrator::{FilterReport, FilteringOrchestrator, OrchestratorState, Trigger};
pub use process::{ProcessInspector, ProcessProbe, SystemProcesses};
pub use scratchpad::{CloseOutcome, ScratchpadRegistry, ScratchpadRegistryEntry, ToggleOutcome};
pub use tree::{Geometry, WindowNode, WindowTreeSnapshot};
pub use visibility::{decide, Decision};
