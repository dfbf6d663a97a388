//! Key and value relations supplied by the embedding storage engine.
//!
//! The index never requires `Ord` on its key type directly; tuple keys in a
//! storage engine compare through schema-aware comparators constructed at
//! runtime. A single relation object implements all three traits and rides
//! along as a defaulted type parameter, the way `HashMap` carries its hasher.

/// Strict weak ordering over keys, total for every key the index will see.
pub trait KeyOrdering<K> {
    fn less(&self, a: &K, b: &K) -> bool;
}

/// Key equivalence, consistent with [`KeyOrdering`]: neither less nor
/// greater implies equal.
pub trait KeyEquality<K> {
    fn equal(&self, a: &K, b: &K) -> bool;
}

/// Value equivalence; disambiguates duplicate-key entries.
pub trait ValueEquality<V> {
    fn equal(&self, a: &V, b: &V) -> bool;
}

/// Relation backed by the types' own `Ord` / `PartialEq`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NaturalOrder;

impl<K: Ord> KeyOrdering<K> for NaturalOrder {
    fn less(&self, a: &K, b: &K) -> bool {
        a < b
    }
}

impl<K: Eq> KeyEquality<K> for NaturalOrder {
    fn equal(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

impl<V: PartialEq> ValueEquality<V> for NaturalOrder {
    fn equal(&self, a: &V, b: &V) -> bool {
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_order_follows_ord() {
        let relation = NaturalOrder;
        assert!(KeyOrdering::<i32>::less(&relation, &1, &2));
        assert!(!KeyOrdering::<i32>::less(&relation, &2, &2));
        assert!(KeyEquality::<i32>::equal(&relation, &2, &2));
        assert!(ValueEquality::<&str>::equal(&relation, &"x", &"x"));
    }
}
