// ============================================================================
// Sync Engine Facade
// ============================================================================

pub mod engine;

pub use engine::SyncEngine;
