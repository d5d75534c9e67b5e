//! Bitset joins across component storages.
//!
//! Every storage keeps a presence bit per entity index. Joining N component
//! types is an AND of their presence words; each set bit in the result is an
//! entity which has every component. The AND runs eight words (256 entities)
//! at a time, which the compiler turns into vector instructions where they
//! are available, followed by a scalar loop for the remainder.

use rustc_hash::FxHashMap;

use crate::component::{Component, ComponentTypeID};
use crate::entity::EntityID;
use crate::registry::Registry;

/// The number of bitset words processed together.
pub const LANE_WORDS: usize = 8;

const WORD_BITS: usize = 32;

/// Iterate over the indices of every set bit in `words`, in ascending order.
pub fn set_bits(words: &[u32]) -> impl Iterator<Item = usize> + '_ {
    words.iter().enumerate().flat_map(|(word_index, &word)| {
        let mut remaining = word;
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }

            let bit = remaining.trailing_zeros() as usize;
            remaining &= remaining - 1;
            Some(word_index * WORD_BITS + bit)
        })
    })
}

fn emit_bits(word_index: usize, mut word: u32, f: &mut impl FnMut(usize)) {
    while word != 0 {
        let bit = word.trailing_zeros() as usize;
        f(word_index * WORD_BITS + bit);
        word &= word - 1;
    }
}

/// Call `f` with every index which is set in all of `sets`.
///
/// Only the words common to every set are considered.
pub fn for_each_match(sets: &[&[u32]], mut f: impl FnMut(usize)) {
    let common = match sets.iter().map(|s| s.len()).min() {
        Some(common) => common,
        None => return,
    };

    let mut base = 0;
    while base + LANE_WORDS <= common {
        let mut lane = [u32::MAX; LANE_WORDS];
        for set in sets {
            for (acc, word) in lane.iter_mut().zip(&set[base..base + LANE_WORDS]) {
                *acc &= *word;
            }
        }

        for (offset, word) in lane.iter().enumerate() {
            emit_bits(base + offset, *word, &mut f);
        }

        base += LANE_WORDS;
    }

    for word_index in base..common {
        let word = sets.iter().fold(u32::MAX, |acc, set| acc & set[word_index]);
        emit_bits(word_index, word, &mut f);
    }
}

/// A materialised intersection of presence bitsets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JoinMask {
    words: Vec<u32>,
}

impl JoinMask {
    /// Compute the intersection of `sets`.
    pub fn intersect(sets: &[&[u32]]) -> JoinMask {
        let common = sets.iter().map(|s| s.len()).min().unwrap_or(0);
        let mut words = vec![u32::MAX; common];

        let mut lanes = words.chunks_exact_mut(LANE_WORDS);
        let mut base = 0;
        for lane in &mut lanes {
            for set in sets {
                for (acc, word) in lane.iter_mut().zip(&set[base..base + LANE_WORDS]) {
                    *acc &= *word;
                }
            }
            base += LANE_WORDS;
        }

        for (offset, acc) in lanes.into_remainder().iter_mut().enumerate() {
            for set in sets {
                *acc &= set[base + offset];
            }
        }

        JoinMask { words }
    }

    /// Return the words of the mask.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Iterate over the entity indices in the mask.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        set_bits(&self.words)
    }

    /// Return the number of entity indices in the mask.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

macro_rules! join_fns {
    ($join:ident, $join_mut:ident, $n:literal; $A:ident $a:ident $(, $T:ident $t:ident)+) => {
        #[doc = concat!("Call `f` for every entity which has all ", $n, " component types.")]
        ///
        /// Returns the number of matching entities. Types which have never
        /// been added to the registry match nothing.
        pub fn $join<$A: Component $(, $T: Component)+>(
            registry: &Registry,
            mut f: impl FnMut(EntityID, &$A $(, &$T)+),
        ) -> usize {
            let $a = match registry.read::<$A>() {
                Some(s) => s,
                None => return 0,
            };
            $(
                let $t = match registry.read::<$T>() {
                    Some(s) => s,
                    None => return 0,
                };
            )+

            let mut count = 0;
            for_each_match(&[$a.presence_words() $(, $t.presence_words())+], |index| {
                let slot = match $a.slot_of_index(index) {
                    Some(slot) => slot,
                    None => return,
                };
                let entity = $a.dense()[slot];
                let $a = match $a.component_at(slot) {
                    Some(c) => c,
                    None => return,
                };
                $(
                    let $t = match $t.get_by_index(index) {
                        Some(c) => c,
                        None => return,
                    };
                )+

                f(entity, $a $(, $t)+);
                count += 1;
            });

            count
        }

        #[doc = concat!("Call `f` for every entity which has all ", $n, " component types, with the first mutable.")]
        ///
        /// The first component type must differ from the others. Writing through
        /// the reference does not mark the component dirty.
        pub fn $join_mut<$A: Component $(, $T: Component)+>(
            registry: &Registry,
            mut f: impl FnMut(EntityID, &mut $A $(, &$T)+),
        ) -> usize {
            $(
                assert_ne!(
                    $A::type_id(), $T::type_id(),
                    "{} is joined mutably and immutably at once",
                    std::any::type_name::<$A>(),
                );
            )+

            let mut $a = match registry.write::<$A>() {
                Some(s) => s,
                None => return 0,
            };
            $(
                let $t = match registry.read::<$T>() {
                    Some(s) => s,
                    None => return 0,
                };
            )+

            let mask = JoinMask::intersect(&[$a.presence_words() $(, $t.presence_words())+]);
            let mut count = 0;
            for index in mask.iter() {
                let slot = match $a.slot_of_index(index) {
                    Some(slot) => slot,
                    None => continue,
                };
                let entity = $a.dense()[slot];
                $(
                    let $t = match $t.get_by_index(index) {
                        Some(c) => c,
                        None => continue,
                    };
                )+
                let first = match $a.component_at_mut(slot) {
                    Some(c) => c,
                    None => continue,
                };

                f(entity, first $(, $t)+);
                count += 1;
            }

            count
        }
    };
}

join_fns!(join2, join2_mut, "2"; A a, B b);
join_fns!(join3, join3_mut, "3"; A a, B b, C c);
join_fns!(join4, join4_mut, "4"; A a, B b, C c, D d);
join_fns!(join5, join5_mut, "5"; A a, B b, C c, D d, E e);
join_fns!(join6, join6_mut, "6"; A a, B b, C c, D d, E e, F6 f6);

struct CacheEntry {
    sources: Vec<(ComponentTypeID, u64)>,
    mask: JoinMask,
}

/// A cache of join masks keyed by a caller-chosen query ID.
///
/// A mask is recomputed when any of its source storages has changed
/// structurally (an entity joined or left it) since the mask was built.
/// Overwriting component values does not invalidate a mask.
#[derive(Default)]
pub struct JoinCache {
    entries: FxHashMap<u64, CacheEntry>,
    recomputations: u64,
}

impl JoinCache {
    /// Create a new, empty, cache.
    pub fn new() -> JoinCache {
        JoinCache::default()
    }

    /// Return the number of cached masks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return how many times a mask has been (re)computed.
    pub fn recomputations(&self) -> u64 {
        self.recomputations
    }

    /// Drop the cached mask for a query.
    pub fn invalidate(&mut self, query_id: u64) {
        self.entries.remove(&query_id);
    }

    /// Drop every cached mask.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn refresh(&mut self, query_id: u64, sources: Vec<(ComponentTypeID, u64)>, sets: &[&[u32]]) -> &JoinMask {
        let stale = self.entries.get(&query_id).map_or(true, |e| e.sources != sources);
        if stale {
            self.recomputations += 1;
            tracing::trace!(query_id, "recomputing cached join");
            self.entries.insert(query_id, CacheEntry {
                sources,
                mask: JoinMask::intersect(sets),
            });
        }

        &self.entries[&query_id].mask
    }

    /// Return the cached mask for the given component types, recomputing it
    /// if required.
    ///
    /// Returns `None` if any of the types has no storage.
    pub fn mask(&mut self, query_id: u64, registry: &Registry, types: &[ComponentTypeID]) -> Option<&JoinMask> {
        let guards = types.iter()
            .map(|t| registry.read_erased(*t))
            .collect::<Option<Vec<_>>>()?;
        let sources = guards.iter().map(|g| (g.component_type(), g.version())).collect();
        let sets = guards.iter().map(|g| g.raw().presence_words).collect::<Vec<_>>();
        Some(self.refresh(query_id, sources, &sets))
    }

    /// A cached version of `join2`.
    pub fn join2<A: Component, B: Component>(
        &mut self,
        query_id: u64,
        registry: &Registry,
        mut f: impl FnMut(EntityID, &A, &B),
    ) -> usize {
        let (a, b) = match (registry.read::<A>(), registry.read::<B>()) {
            (Some(a), Some(b)) => (a, b),
            _ => return 0,
        };

        let sources = vec![(A::type_id(), a.version()), (B::type_id(), b.version())];
        let mask = self.refresh(query_id, sources, &[a.presence_words(), b.presence_words()]);

        let mut count = 0;
        for index in mask.iter() {
            if let (Some(slot), Some(cb)) = (a.slot_of_index(index), b.get_by_index(index)) {
                if let Some(ca) = a.component_at(slot) {
                    f(a.dense()[slot], ca, cb);
                    count += 1;
                }
            }
        }

        count
    }

    /// A cached version of `join3`.
    pub fn join3<A: Component, B: Component, C: Component>(
        &mut self,
        query_id: u64,
        registry: &Registry,
        mut f: impl FnMut(EntityID, &A, &B, &C),
    ) -> usize {
        let (a, b, c) = match (registry.read::<A>(), registry.read::<B>(), registry.read::<C>()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => return 0,
        };

        let sources = vec![
            (A::type_id(), a.version()),
            (B::type_id(), b.version()),
            (C::type_id(), c.version()),
        ];
        let mask = self.refresh(query_id, sources, &[a.presence_words(), b.presence_words(), c.presence_words()]);

        let mut count = 0;
        for index in mask.iter() {
            let slot = match a.slot_of_index(index) {
                Some(slot) => slot,
                None => continue,
            };

            if let (Some(ca), Some(cb), Some(cc)) = (a.component_at(slot), b.get_by_index(index), c.get_by_index(index)) {
                f(a.dense()[slot], ca, cb, cc);
                count += 1;
            }
        }

        count
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::component;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position(i32);

    component!(Position);

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Velocity(i32);

    component!(Velocity);

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Mass(i32);

    component!(Mass);

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Health(i32);

    component!(Health);

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Charge(i32);

    component!(Charge);

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Tag(i32);

    component!(Tag);

    #[test]
    fn test_set_bits() {
        let bits: Vec<_> = set_bits(&[0b1010, 0, 1 << 31]).collect();
        assert_eq!(bits, vec![1, 3, 95]);
    }

    #[test]
    fn test_lanes_match_scalar() {
        let a: Vec<u32> = (0..21).map(|i| 0x9E37_79B9u32.wrapping_mul(i + 1)).collect();
        let b: Vec<u32> = (0..19).map(|i| 0x85EB_CA6Bu32.wrapping_mul(i + 7)).collect();

        let mut found = Vec::new();
        for_each_match(&[&a[..], &b[..]], |idx| found.push(idx));

        let mut expected = Vec::new();
        for w in 0..19 {
            for bit in 0..32 {
                if (a[w] & b[w]) & (1 << bit) != 0 {
                    expected.push(w * 32 + bit);
                }
            }
        }

        assert_eq!(found, expected);
        assert_eq!(JoinMask::intersect(&[&a[..], &b[..]]).iter().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_join2() {
        let mut registry = Registry::new();
        let mut entities = Vec::new();
        for i in 0..600 {
            let e = registry.create();
            registry.add(e, Position(i));
            if i % 3 == 0 {
                registry.add(e, Velocity(i * 10));
            }
            entities.push(e);
        }

        let mut seen = Vec::new();
        let count = join2::<Position, Velocity>(&registry, |e, p, v| {
            assert_eq!(p.0 * 10, v.0);
            seen.push(e);
        });

        assert_eq!(count, 200);
        assert_eq!(seen, entities.iter().step_by(3).copied().collect::<Vec<_>>());
    }

    #[test]
    fn test_join3_missing_storage() {
        #[derive(Debug, Clone, Copy)]
        struct Unused;
        component!(Unused);

        let mut registry = Registry::new();
        let e = registry.create();
        registry.add(e, Position(1));
        registry.add(e, Velocity(1));
        registry.add(e, Mass(1));

        assert_eq!(join3::<Position, Velocity, Mass>(&registry, |_, _, _, _| {}), 1);
        assert_eq!(join3::<Position, Velocity, Unused>(&registry, |_, _, _, _| {}), 0);
    }

    #[test]
    fn test_join_wide() {
        let mut registry = Registry::new();
        let mut entities = Vec::new();
        for i in 0..64 {
            let e = registry.create();
            registry.add(e, Position(i));
            if i % 2 == 0 { registry.add(e, Velocity(i)); }
            if i % 3 == 0 { registry.add(e, Mass(i)); }
            if i % 4 == 0 { registry.add(e, Health(i)); }
            if i % 5 == 0 { registry.add(e, Charge(i)); }
            if i % 6 == 0 { registry.add(e, Tag(i)); }
            entities.push(e);
        }

        let mut seen = Vec::new();
        let count = join4::<Position, Velocity, Mass, Health>(&registry, |e, p, v, m, h| {
            assert!(p.0 == v.0 && v.0 == m.0 && m.0 == h.0);
            seen.push(e);
        });
        assert_eq!(count, 6);
        assert_eq!(seen, entities.iter().step_by(12).copied().collect::<Vec<_>>());

        let mut seen = Vec::new();
        let count = join5::<Position, Velocity, Mass, Health, Charge>(&registry, |e, p, _, _, _, c| {
            assert_eq!(p.0, c.0);
            seen.push(e);
        });
        assert_eq!(count, 2);
        assert_eq!(seen, vec![entities[0], entities[60]]);

        let mut total = 0;
        let count = join6::<Position, Velocity, Mass, Health, Charge, Tag>(&registry, |_, _, _, _, _, _, t| {
            total += t.0;
        });
        assert_eq!(count, 2);
        assert_eq!(total, 60);

        registry.remove::<Tag>(entities[60]);
        assert_eq!(join6::<Position, Velocity, Mass, Health, Charge, Tag>(&registry, |_, _, _, _, _, _, _| {}), 1);
    }

    #[test]
    fn test_join_mut_wide() {
        let mut registry = Registry::new();
        let mut entities = Vec::new();
        for i in 0..10 {
            let e = registry.create();
            registry.add(e, Position(0));
            registry.add(e, Velocity(1));
            registry.add(e, Mass(2));
            registry.add(e, Health(3));
            registry.add(e, Charge(4));
            if i != 9 {
                registry.add(e, Tag(5));
            }
            entities.push(e);
        }

        assert_eq!(join3_mut::<Position, Velocity, Mass>(&registry, |_, p, v, m| p.0 += v.0 * m.0), 10);
        assert_eq!(join4_mut::<Position, Velocity, Mass, Health>(&registry, |_, p, _, _, h| p.0 += h.0), 10);
        assert_eq!(join5_mut::<Position, Velocity, Mass, Health, Charge>(&registry, |_, p, _, _, _, c| p.0 += c.0), 10);
        assert_eq!(join6_mut::<Position, Velocity, Mass, Health, Charge, Tag>(&registry, |_, p, _, _, _, _, t| p.0 += t.0), 9);

        assert_eq!(registry.get::<Position>(entities[0]), Some(Position(14)));
        assert_eq!(registry.get::<Position>(entities[9]), Some(Position(9)));
        assert_eq!(registry.get::<Velocity>(entities[0]), Some(Velocity(1)));
    }

    #[test]
    #[should_panic(expected = "joined mutably and immutably")]
    fn test_join_mut_aliasing_later_type() {
        let registry = Registry::new();
        join4_mut::<Position, Velocity, Mass, Position>(&registry, |_, _, _, _, _| {});
    }

    #[test]
    fn test_join2_mut() {
        let mut registry = Registry::new();
        for i in 0..10 {
            let e = registry.create();
            registry.add(e, Position(i));
            registry.add(e, Velocity(1));
        }

        let count = join2_mut::<Position, Velocity>(&registry, |_, p, v| p.0 += v.0);
        assert_eq!(count, 10);

        let mut total = 0;
        join2::<Position, Velocity>(&registry, |_, p, _| total += p.0);
        assert_eq!(total, (1..=10).sum::<i32>());
    }

    #[test]
    #[should_panic(expected = "joined mutably and immutably")]
    fn test_join_mut_aliasing() {
        let registry = Registry::new();
        join2_mut::<Position, Position>(&registry, |_, _, _| {});
    }

    #[test]
    fn test_cached_join() {
        let mut registry = Registry::new();
        let a = registry.create();
        let b = registry.create();
        registry.add(a, Position(1));
        registry.add(a, Velocity(1));
        registry.add(b, Position(2));

        let mut cache = JoinCache::new();
        assert_eq!(cache.join2::<Position, Velocity>(7, &registry, |_, _, _| {}), 1);
        assert_eq!(cache.join2::<Position, Velocity>(7, &registry, |_, _, _| {}), 1);
        assert_eq!(cache.recomputations(), 1);

        // Overwriting a value keeps the mask.
        registry.add(a, Position(5));
        let mut value = 0;
        cache.join2::<Position, Velocity>(7, &registry, |_, p, _| value = p.0);
        assert_eq!(value, 5);
        assert_eq!(cache.recomputations(), 1);

        // A structural change invalidates it.
        registry.add(b, Velocity(2));
        assert_eq!(cache.join2::<Position, Velocity>(7, &registry, |_, _, _| {}), 2);
        assert_eq!(cache.recomputations(), 2);

        let mask = cache.mask(7, &registry, &[Position::type_id(), Velocity::type_id()]).unwrap();
        assert_eq!(mask.count(), 2);
        assert_eq!(cache.recomputations(), 2);

        // So does removing a component.
        registry.remove::<Velocity>(a);
        assert_eq!(cache.join2::<Position, Velocity>(7, &registry, |_, _, _| {}), 1);
        assert_eq!(cache.recomputations(), 3);
        assert_eq!(cache.join2::<Position, Velocity>(7, &registry, |_, _, _| {}), 1);
        assert_eq!(cache.recomputations(), 3);

        cache.invalidate(7);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cached_join3() {
        let mut registry = Registry::new();
        let mut entities = Vec::new();
        for i in 0..40 {
            let e = registry.create();
            registry.add(e, Position(i));
            registry.add(e, Velocity(i * 2));
            if i % 4 == 0 {
                registry.add(e, Mass(i * 3));
            }
            entities.push(e);
        }

        let mut cache = JoinCache::new();
        let mut seen = Vec::new();
        let count = cache.join3::<Position, Velocity, Mass>(1, &registry, |e, p, v, m| {
            assert_eq!((p.0 * 2, p.0 * 3), (v.0, m.0));
            seen.push(e);
        });
        assert_eq!(count, 10);
        assert_eq!(seen, entities.iter().step_by(4).copied().collect::<Vec<_>>());
        assert_eq!(cache.join3::<Position, Velocity, Mass>(1, &registry, |_, _, _, _| {}), 10);
        assert_eq!(cache.recomputations(), 1);

        // Each query ID keeps its own mask.
        assert_eq!(cache.join2::<Position, Mass>(2, &registry, |_, _, _| {}), 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.recomputations(), 2);

        registry.remove::<Mass>(entities[4]);
        assert_eq!(cache.join3::<Position, Velocity, Mass>(1, &registry, |_, _, _, _| {}), 9);
        assert_eq!(cache.recomputations(), 3);

        registry.destroy(entities[8]);
        assert_eq!(cache.join3::<Position, Velocity, Mass>(1, &registry, |_, _, _, _| {}), 8);
        assert_eq!(cache.recomputations(), 4);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.join3::<Position, Velocity, Mass>(1, &registry, |_, _, _, _| {}), 8);
        assert_eq!(cache.recomputations(), 5);
    }
}
