//! Reopen chains.
//!
//! Reopening never edits a closed row; it adds a new row whose
//! `original_defect` points back. A chain is therefore a singly linked list
//! from the newest row to the first occurrence of the failure.

use std::collections::HashSet;

use testpulse_state::{Defect, DefectId, DefectStore};

use crate::error::{EngineError, Result};

pub struct DefectHistory;

impl DefectHistory {
    /// `id` followed by every row it was reopened from, newest first.
    ///
    /// A link to a row that no longer exists ends the chain.
    pub async fn chain(defects: &dyn DefectStore, id: &DefectId) -> Result<Vec<Defect>> {
        let first = defects
            .get(id)
            .await?
            .ok_or_else(|| EngineError::not_found("defect", id))?;

        let mut seen: HashSet<DefectId> = HashSet::new();
        let mut next = first.original_defect.clone();
        seen.insert(first.id.clone());
        let mut chain = vec![first];

        while let Some(prev_id) = next {
            if !seen.insert(prev_id.clone()) {
                break;
            }
            let Some(prev) = defects.get(&prev_id).await? else {
                break;
            };
            next = prev.original_defect.clone();
            chain.push(prev);
        }
        Ok(chain)
    }

    /// The first occurrence of the failure `id` belongs to.
    pub async fn root(defects: &dyn DefectStore, id: &DefectId) -> Result<Defect> {
        let mut chain = Self::chain(defects, id).await?;
        chain
            .pop()
            .ok_or_else(|| EngineError::not_found("defect", id))
    }
}
