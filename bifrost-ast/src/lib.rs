pub mod decorator;
pub mod inspector;
pub mod params;

pub use decorator::DecoratorKind;
pub use inspector::{inspect, ArtifactClass, EntityMetadata, InspectionResult, SyntaxIssue};

/// Decorator sentinels the fast path scans for. Kept as raw byte needles
/// rather than identifiers because the fast path runs before any parse.
pub const SENTINELS: [&str; 3] = ["@workflow", "@tool", "@data_provider"];

/// `true` if none of the decorator sentinels appear anywhere in `source`.
/// Callers should classify such sources as `ArtifactClass::Module` without
/// invoking the parser.
pub fn fast_path_is_plain_module(source: &str) -> bool {
    !SENTINELS.iter().any(|needle| source.contains(needle))
}
