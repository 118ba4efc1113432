//! Entity trait: records with identity that outlives their state changes.

/// Entity marker + minimal interface.
///
/// Ownership records and ledger entries are entities: two records with identical fields
/// but different ids are different records.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
