pub mod exports;
pub mod snapshots;

pub use exports::Exporter;
pub use snapshots::SnapshotStore;
