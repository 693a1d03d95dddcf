//! # Primitives
//!
//! Fixed constants of the store: wire tags of the bean codec, storage format
//! markers and input limits. These are compiled in and never change at runtime.

// =============================================================================
// CODEC WIRE FORMAT
// =============================================================================

/// High bit of a type tag: the payload is a list of the element type.
pub const LIST_TAG_FLAG: u8 = 0x80;

/// Element type codes. The low seven bits of a tag carry one of these.
pub const TAG_BYTE: u8 = 1;
pub const TAG_SHORT: u8 = 2;
pub const TAG_INTEGER: u8 = 3;
pub const TAG_LONG: u8 = 4;
pub const TAG_FLOAT: u8 = 5;
pub const TAG_DOUBLE: u8 = 6;
pub const TAG_BOOLEAN: u8 = 7;
pub const TAG_STRING: u8 = 8;
pub const TAG_REFERENCE: u8 = 9;

/// Upper bound on an encoded bean accepted by the decoder.
///
/// Guards against corrupt lengths inside a record turning into huge allocations.
pub const MAX_ENCODED_BEAN_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// STORAGE FORMAT
// =============================================================================

/// Version of the on-disk layout written by the redb backend.
///
/// Increment this when making breaking changes to table layout or value framing.
pub const STORAGE_FORMAT_VERSION: u64 = 1;

/// Flag bit in the first byte of a stored bean value: the bean is a default instance.
pub const STORED_DEFAULT_FLAG: u8 = 0x01;

// =============================================================================
// INPUT LIMITS
// =============================================================================

/// Maximum length of schema, property and instance names.
pub const MAX_NAME_LENGTH: usize = 512;

/// Maximum number of values a single property may carry.
pub const MAX_VALUES_PER_PROPERTY: usize = 65_536;

/// Default page size of a query when the caller sets none.
pub const DEFAULT_MAX_RESULTS: usize = usize::MAX;
