use thiserror::Error;

/// Input-violation errors reported by the filter engine.
///
/// Internal invariant violations are not represented here; they are
/// `debug_assert!`ed and never occur on valid inputs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("bulk-load keys must be sorted and strictly increasing")]
    UnsortedKeys,
    #[error("key is not present in the filter")]
    KeyNotFound,
    #[error("filter has no boundary keys; bulk-load (possibly empty) before mutating")]
    EmptyFilter,
    #[error("serialized metadata does not match this build's constants")]
    MetadataMismatch,
    #[error("serialized buffer is truncated or malformed")]
    MalformedBuffer,
}
