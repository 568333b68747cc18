//! Merge operands and the operator that combines them.

use crate::value::UserValue;

/// Combines a base value with a chain of merge operands.
///
/// The operator must be associative: combining in any grouping yields the
/// same result, which is what allows operands to be accumulated lazily
/// and collapsed during reads or compaction.
pub trait MergeOperator: Send + Sync {
    /// Produces the merged value for `user_key`.
    ///
    /// `existing` is the newest plain value below the operand chain, or
    /// `None` if the chain bottoms out at a tombstone or at nothing.
    /// `operands` are ordered oldest to newest.
    ///
    /// Returning `None` signals that the merge failed; the read surfaces
    /// this as a merge still being in progress.
    fn full_merge(
        &self,
        user_key: &[u8],
        existing: Option<&[u8]>,
        operands: &[&[u8]],
    ) -> Option<Vec<u8>>;
}

/// Accumulates merge operands encountered while walking a key's history,
/// newest first.
#[derive(Default)]
pub struct MergeContext {
    operands: Vec<UserValue>,
    base: Option<UserValue>,
}

impl MergeContext {
    /// Appends an operand; callers walk from newest to oldest, so the
    /// stored order is newest first.
    pub fn push_operand(&mut self, operand: &[u8]) {
        self.operands.push(operand.into());
    }

    /// Operands in the order they were pushed (newest first)
    #[must_use]
    pub fn operands(&self) -> &[UserValue] {
        &self.operands
    }

    /// Number of collected operands
    #[must_use]
    pub fn len(&self) -> usize {
        self.operands.len()
    }

    /// Whether any operands were collected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operands.is_empty()
    }

    pub(crate) fn set_base(&mut self, base: &[u8]) {
        self.base = Some(base.into());
    }

    /// The base value the operand chain bottomed out at, if the read was
    /// asked not to combine
    #[must_use]
    pub fn base(&self) -> Option<&[u8]> {
        self.base.as_deref()
    }

    /// Runs the operator over the collected operands, oldest first
    pub(crate) fn full_merge(
        &self,
        operator: &dyn MergeOperator,
        user_key: &[u8],
        existing: Option<&[u8]>,
    ) -> Option<Vec<u8>> {
        let oldest_first: Vec<&[u8]> = self.operands.iter().rev().map(|op| &**op).collect();
        operator.full_merge(user_key, existing, &oldest_first)
    }

    /// Drops all collected state
    pub fn clear(&mut self) {
        self.operands.clear();
        self.base = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    struct Concat;

    impl MergeOperator for Concat {
        fn full_merge(
            &self,
            _user_key: &[u8],
            existing: Option<&[u8]>,
            operands: &[&[u8]],
        ) -> Option<Vec<u8>> {
            let mut out = existing.map(<[u8]>::to_vec).unwrap_or_default();
            for op in operands {
                out.extend_from_slice(op);
            }
            Some(out)
        }
    }

    #[test]
    fn operands_combine_oldest_first() {
        let mut ctx = MergeContext::default();

        // Walked newest to oldest
        ctx.push_operand(b"C");
        ctx.push_operand(b"B");

        assert_eq!(2, ctx.len());
        assert_eq!(
            Some(b"ABC".to_vec()),
            ctx.full_merge(&Concat, b"k", Some(b"A"))
        );
    }

    #[test]
    fn merge_without_base() {
        let mut ctx = MergeContext::default();
        ctx.push_operand(b"y");
        ctx.push_operand(b"x");

        assert_eq!(Some(b"xy".to_vec()), ctx.full_merge(&Concat, b"k", None));
    }
}
