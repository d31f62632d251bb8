use rkyv::{Archive, Deserialize, Serialize};
use std::fmt;

/// Relation id value meaning "all relations in this database".
///
/// Mirrors the host server's invalid-oid convention: 0 never names a real
/// relation, so a close request carrying it targets the whole database.
pub const ALL_RELATIONS: u32 = 0;

/// Identity of one logical relation's dedicated worker process.
///
/// Equality is structural; this is the key of the manager's worker registry
/// and of each backend's dispatch cache.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rkyv(derive(Debug, PartialEq, Eq, Hash))]
pub struct WorkerIdentity {
    pub database_id: u32,
    pub relation_id: u32,
}

impl WorkerIdentity {
    pub fn new(database_id: u32, relation_id: u32) -> Self {
        Self {
            database_id,
            relation_id,
        }
    }

    /// Sentinel identity targeting every relation in `database_id`.
    pub fn all_relations(database_id: u32) -> Self {
        Self {
            database_id,
            relation_id: ALL_RELATIONS,
        }
    }

    /// True if this identity is the bulk "all relations" sentinel.
    pub fn is_all_relations(&self) -> bool {
        self.relation_id == ALL_RELATIONS
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all_relations() {
            write!(f, "{}/*", self.database_id)
        } else {
            write!(f, "{}/{}", self.database_id, self.relation_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_matches_whole_database() {
        let ident = WorkerIdentity::all_relations(5);
        assert!(ident.is_all_relations());
        assert_eq!(ident.database_id, 5);
        assert_eq!(ident.to_string(), "5/*");
    }

    #[test]
    fn structural_equality() {
        assert_eq!(WorkerIdentity::new(1, 10), WorkerIdentity::new(1, 10));
        assert_ne!(WorkerIdentity::new(1, 10), WorkerIdentity::new(2, 10));
        assert_ne!(WorkerIdentity::new(1, 10), WorkerIdentity::new(1, 11));
    }

    #[test]
    fn display_names_db_and_relation() {
        assert_eq!(WorkerIdentity::new(3, 42).to_string(), "3/42");
    }
}
