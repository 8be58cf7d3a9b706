//! Directed relationship edits.

use crate::id_table::IdRef;
use commitplan_core::ArcId;

/// One observed relationship edit: source, target, arc and polarity.
///
/// A bidirectional association is observed from both endpoints; the edit seen
/// from the other side is this edit's [`reversed`](ArcTarget::reversed) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArcTarget {
    pub source: IdRef,
    pub target: IdRef,
    pub arc: ArcId,
    pub delete: bool,
}

impl ArcTarget {
    pub fn new(source: IdRef, target: IdRef, arc: ArcId, delete: bool) -> Self {
        Self {
            source,
            target,
            arc,
            delete,
        }
    }

    /// The same edit as seen from the target.
    pub fn reversed(&self) -> Self {
        Self {
            source: self.target,
            target: self.source,
            arc: self.arc.reversed(),
            delete: self.delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_table::IdTable;
    use commitplan_core::ObjectId;

    #[test]
    fn test_reversal_matches_other_side() {
        let mut ids = IdTable::new(4);
        let a = ids.intern(&ObjectId::temporary("Artist"));
        let p = ids.intern(&ObjectId::temporary("Painting"));
        let forward = ArcTarget::new(a, p, ArcId::with_reverse("paintings", "artist"), false);
        let backward = ArcTarget::new(p, a, ArcId::with_reverse("artist", "paintings"), false);
        assert_eq!(forward.reversed(), backward);
        assert_eq!(backward.reversed(), forward);
    }

    #[test]
    fn test_polarity_is_part_of_equality() {
        let mut ids = IdTable::new(4);
        let a = ids.intern(&ObjectId::temporary("Artist"));
        let p = ids.intern(&ObjectId::temporary("Painting"));
        let created = ArcTarget::new(a, p, ArcId::new("paintings"), false);
        let deleted = ArcTarget::new(a, p, ArcId::new("paintings"), true);
        assert_ne!(created, deleted);
    }
}
