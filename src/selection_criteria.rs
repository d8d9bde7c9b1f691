use std::{fmt, sync::Arc};

use crate::{
    options::ServerAddress,
    sdam::{public::ServerInfo, ServerType},
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type and
    /// latency.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    Predicate(Predicate),
}

impl fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadPreference(rp) => f.debug_tuple("ReadPreference").field(rp).finish(),
            Self::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }

    /// Criteria that only matches the server at `address`, used to pin follow-up commands such as
    /// `getMore` to the server that created a cursor.
    pub(crate) fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address() == &address))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Specifies how the driver should route a read operation to members of a replica set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    #[default]
    Primary,

    /// Only route this operation to a secondary.
    Secondary,

    /// Route this operation to the primary if it's available, but fall back to the secondaries if
    /// not.
    PrimaryPreferred,

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred,

    /// Route this operation to the node with the least network latency regardless of whether it's
    /// the primary or a secondary.
    Nearest,
}

impl ReadPreference {
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::Secondary => "secondary",
            ReadPreference::PrimaryPreferred => "primaryPreferred",
            ReadPreference::SecondaryPreferred => "secondaryPreferred",
            ReadPreference::Nearest => "nearest",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        Some(match s.to_lowercase().as_str() {
            "primary" => ReadPreference::Primary,
            "secondary" => ReadPreference::Secondary,
            "primarypreferred" => ReadPreference::PrimaryPreferred,
            "secondarypreferred" => ReadPreference::SecondaryPreferred,
            "nearest" => ReadPreference::Nearest,
            _ => return None,
        })
    }

    /// Whether a server of the given type in a replica set satisfies this read preference, not
    /// taking the fallbacks of the "preferred" modes into account.
    pub(crate) fn matches_replica_set_member(&self, server_type: ServerType) -> bool {
        match self {
            ReadPreference::Primary | ReadPreference::PrimaryPreferred => {
                server_type == ServerType::RsPrimary
            }
            ReadPreference::Secondary | ReadPreference::SecondaryPreferred => {
                server_type == ServerType::RsSecondary
            }
            ReadPreference::Nearest => {
                matches!(server_type, ServerType::RsPrimary | ServerType::RsSecondary)
            }
        }
    }
}
