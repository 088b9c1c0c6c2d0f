//! Navigation and locking engine.
//!
//! Converts between absolute question numbers and `(group, local)` positions,
//! and owns the answer sheet: selected options, review flags, and the locked
//! set. Locked numbers never change again.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

use crate::error::NavigationError;
use crate::model::{OptionLetter, TestDefinition};
use crate::order::{resolve_layout, BaseOrderTable, GroupSpan, Layout, Numbering};

/// A question's position inside the definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub group_index: usize,
    /// 0-based index of the question within its group.
    pub local_index: usize,
}

/// Outcome of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOutcome {
    pub group_index: usize,
    /// Numbers that were not locked before this call.
    pub newly_locked: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct Navigator {
    layout: Layout,
    answers: BTreeMap<u32, OptionLetter>,
    flags: BTreeSet<u32>,
    locked: BTreeSet<u32>,
}

impl Navigator {
    /// Build from a definition and its order table, degrading to contiguous
    /// numbering when the table is unusable.
    pub fn new(definition: &TestDefinition, table: &BaseOrderTable) -> Self {
        Self::from_layout(resolve_layout(definition, table))
    }

    pub fn from_layout(layout: Layout) -> Self {
        Self {
            layout,
            answers: BTreeMap::new(),
            flags: BTreeSet::new(),
            locked: BTreeSet::new(),
        }
    }

    pub fn numbering(&self) -> Numbering {
        self.layout.numbering
    }

    pub fn group_count(&self) -> usize {
        self.layout.spans.len()
    }

    pub fn span(&self, group_index: usize) -> Option<GroupSpan> {
        self.layout.spans.get(group_index).copied()
    }

    /// Absolute numbers covered by a group.
    pub fn group_range(&self, group_index: usize) -> Option<RangeInclusive<u32>> {
        self.span(group_index)
            .filter(|s| s.count > 0)
            .map(|s| s.base..=s.last())
    }

    /// `base_order(group) + local_index`.
    pub fn absolute_number(&self, group_index: usize, local_index: usize) -> Option<u32> {
        let span = self.span(group_index)?;
        let local = u32::try_from(local_index).ok()?;
        if local < span.count {
            span.base.checked_add(local)
        } else {
            None
        }
    }

    pub fn locate(&self, number: u32) -> Result<Position, NavigationError> {
        self.layout
            .spans
            .iter()
            .enumerate()
            .find(|(_, span)| span.contains(number))
            .map(|(group_index, span)| Position {
                group_index,
                local_index: (number - span.base) as usize,
            })
            .ok_or(NavigationError::NotFound(number))
    }

    /// Lock every number in a group. Idempotent.
    pub fn lock(&mut self, group_index: usize) -> Result<LockOutcome, NavigationError> {
        let range = self
            .group_range(group_index)
            .ok_or(NavigationError::NoSuchGroup(group_index))?;
        let newly_locked = range.filter(|n| self.locked.insert(*n)).collect();
        Ok(LockOutcome {
            group_index,
            newly_locked,
        })
    }

    pub fn is_locked(&self, number: u32) -> bool {
        self.locked.contains(&number)
    }

    pub fn locked(&self) -> &BTreeSet<u32> {
        &self.locked
    }

    fn check_mutable(&self, number: u32) -> Result<(), NavigationError> {
        self.locate(number)?;
        if self.is_locked(number) {
            return Err(NavigationError::Locked(number));
        }
        Ok(())
    }

    /// Record or change an answer unless the number is locked.
    pub fn try_set_answer(
        &mut self,
        number: u32,
        letter: OptionLetter,
    ) -> Result<(), NavigationError> {
        self.check_mutable(number)?;
        self.answers.insert(number, letter);
        Ok(())
    }

    pub fn clear_answer(&mut self, number: u32) -> Result<(), NavigationError> {
        self.check_mutable(number)?;
        self.answers.remove(&number);
        Ok(())
    }

    /// Flip the review flag. Returns the new flag state.
    pub fn toggle_flag(&mut self, number: u32) -> Result<bool, NavigationError> {
        self.check_mutable(number)?;
        if self.flags.remove(&number) {
            Ok(false)
        } else {
            self.flags.insert(number);
            Ok(true)
        }
    }

    pub fn answer(&self, number: u32) -> Option<OptionLetter> {
        self.answers.get(&number).copied()
    }

    pub fn is_flagged(&self, number: u32) -> bool {
        self.flags.contains(&number)
    }

    pub fn flagged(&self) -> &BTreeSet<u32> {
        &self.flags
    }

    pub fn answered_count(&self) -> usize {
        self.answers.len()
    }
}
