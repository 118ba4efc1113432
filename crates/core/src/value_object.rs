//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values. A catalog item
/// snapshot taken at purchase time is one: it is copied into the ownership record and
/// never changes afterwards, even if the catalog price does.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct Price(i64);
///
/// impl ValueObject for Price {}
///
/// assert_eq!(Price(500), Price(500));
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
