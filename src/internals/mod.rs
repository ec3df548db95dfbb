//! Bookkeeping shared by every multiset: the occupancy counter and the
//! multiplicity table used by `remove_all`.

pub(crate) mod size;
pub(crate) mod tally;
