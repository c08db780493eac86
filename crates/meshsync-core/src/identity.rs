//! Node identity resolution
//!
//! Decides whether an incoming node record may overwrite what is known about
//! that node number, based on continuity of the node's public key. The same
//! resolver runs for live ingestion and for replaying another database's
//! nodes during an identity merge.

use tracing::{debug, warn};

use crate::node::NodeRecord;
use crate::node_db::NodeErrorKind;
use crate::types::node_id_string;

// ----------------------------------------------------------------------------
// Resolution
// ----------------------------------------------------------------------------

/// Outcome of resolving one incoming record
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The record may be merged into the database
    Accepted(NodeRecord),
    /// The record must not be stored
    Rejected {
        /// The existing record, which stays unchanged
        kept: Option<NodeRecord>,
        /// Conflict to record against the incoming node number
        error: Option<NodeErrorKind>,
    },
}

impl Resolution {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Resolution::Accepted(_))
    }

    /// The conflict reported by this resolution, if any
    pub fn error(&self) -> Option<NodeErrorKind> {
        match self {
            Resolution::Accepted(_) => None,
            Resolution::Rejected { error, .. } => error.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Resolver
// ----------------------------------------------------------------------------

/// Stateless key-continuity check
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeIdentityResolver;

impl NodeIdentityResolver {
    /// Resolve `incoming` against every record currently known
    pub fn resolve<'a, I>(incoming: NodeRecord, known: I) -> Resolution
    where
        I: IntoIterator<Item = &'a NodeRecord>,
    {
        let incoming_key = incoming.public_key().cloned();

        let mut same_num: Vec<&NodeRecord> = Vec::new();
        let mut key_claimed_elsewhere = false;
        for node in known {
            if node.num == incoming.num {
                same_num.push(node);
            } else if let (Some(key), Some(other)) = (&incoming_key, node.public_key()) {
                if key == other {
                    key_claimed_elsewhere = true;
                }
            }
        }

        let id = node_id_string(incoming.num);
        match same_num.as_slice() {
            [] => {
                if incoming_key.is_some() && key_claimed_elsewhere {
                    warn!("Rejecting node {}: public key already used by another node", id);
                    return Resolution::Rejected {
                        kept: None,
                        error: Some(NodeErrorKind::DuplicatePki),
                    };
                }
                Resolution::Accepted(incoming)
            }
            [existing] => match (existing.public_key(), &incoming_key) {
                (None, _) => Resolution::Accepted(incoming),
                (Some(old), Some(new)) if old == new => Resolution::Accepted(incoming),
                (Some(_), Some(_)) => {
                    warn!("Rejecting node {}: public key does not match the known key", id);
                    Resolution::Rejected {
                        kept: Some((*existing).clone()),
                        error: Some(NodeErrorKind::MismatchPki),
                    }
                }
                (Some(_), None) => {
                    debug!("Keeping node {}: update carries no public key", id);
                    Resolution::Rejected {
                        kept: Some((*existing).clone()),
                        error: None,
                    }
                }
            },
            _ => {
                warn!("Rejecting node {}: multiple records share this number", id);
                Resolution::Rejected {
                    kept: None,
                    error: Some(NodeErrorKind::DuplicatePki),
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
