//! Child-slot helpers for shadow-node surgery.
//!
//! B-tree splits, merges and borrows shuffle child pointers around inside
//! fixed-size slot arrays. The moves route through the attempt context so
//! the lineage map keeps pointing at each child's current slot; a later
//! duplication of a moved child then patches the right place. Callers
//! only ever pass nodes that are private to the attempt.

use crossbeam_epoch::Shared;

use crate::internals::attempt::AttemptCtx;
use crate::internals::node::ProtoNode;

/// Open the slot at `from` by shifting `[from..used)` one slot right. The
/// caller overwrites the vacated slot.
pub(crate) fn child_shift_right<'g, T: ProtoNode>(
    ctx: &mut AttemptCtx<'g, T>,
    n: Shared<'g, T>,
    from: usize,
    used: usize,
) {
    debug_assert!(used < unsafe { n.deref() }.children().len());
    let mut j = used;
    while j > from {
        let c = ctx.get_child(n, j - 1);
        ctx.relink(n, j, c);
        j -= 1;
    }
}

/// Close the slot at `from` by shifting `(from..used)` one slot left and
/// nulling the vacated tail slot.
pub(crate) fn child_shift_left<'g, T: ProtoNode>(
    ctx: &mut AttemptCtx<'g, T>,
    n: Shared<'g, T>,
    from: usize,
    used: usize,
) {
    debug_assert!(from < used);
    for j in from..used - 1 {
        let c = ctx.get_child(n, j + 1);
        ctx.relink(n, j, c);
    }
    ctx.relink(n, used - 1, Shared::null());
}

/// Move `count` slots from `src` starting at `src_start` onto `dst`
/// starting at `dst_start`, nulling the source slots behind them.
pub(crate) fn child_move_range<'g, T: ProtoNode>(
    ctx: &mut AttemptCtx<'g, T>,
    dst: Shared<'g, T>,
    dst_start: usize,
    src: Shared<'g, T>,
    src_start: usize,
    count: usize,
) {
    for i in 0..count {
        let c = ctx.get_child(src, src_start + i);
        ctx.relink(dst, dst_start + i, c);
        ctx.relink(src, src_start + i, Shared::null());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internals::node::BtNode;
    use crossbeam_epoch::Atomic;

    type TestNode = BtNode<u64, u64, parking_lot::RawMutex>;

    fn raw(s: Shared<'_, TestNode>) -> usize {
        s.as_raw() as usize
    }

    #[test]
    fn test_shift_right_then_left() {
        let guard = crossbeam_epoch::pin();
        let cell: Atomic<TestNode> = Atomic::null();
        let mut ctx = AttemptCtx::open(&cell, &guard);
        let parent = ctx.alloc(TestNode::new_branch());
        let kids: Vec<_> = (0..3).map(|_| ctx.alloc(TestNode::new_leaf())).collect();
        for (i, k) in kids.iter().enumerate() {
            ctx.relink(parent, i, *k);
        }

        child_shift_right(&mut ctx, parent, 1, 3);
        let extra = ctx.alloc(TestNode::new_leaf());
        ctx.relink(parent, 1, extra);
        let got: Vec<_> = (0..4).map(|i| raw(ctx.get_child(parent, i))).collect();
        assert_eq!(got, vec![raw(kids[0]), raw(extra), raw(kids[1]), raw(kids[2])]);

        child_shift_left(&mut ctx, parent, 1, 4);
        let got: Vec<_> = (0..3).map(|i| raw(ctx.get_child(parent, i))).collect();
        assert_eq!(got, vec![raw(kids[0]), raw(kids[1]), raw(kids[2])]);
        assert!(ctx.get_child(parent, 3).is_null());
        // Dropping the unclosed ctx rolls the fresh allocations back.
    }

    #[test]
    fn test_move_range_nulls_source() {
        let guard = crossbeam_epoch::pin();
        let cell: Atomic<TestNode> = Atomic::null();
        let mut ctx = AttemptCtx::open(&cell, &guard);
        let a = ctx.alloc(TestNode::new_branch());
        let b = ctx.alloc(TestNode::new_branch());
        let kids: Vec<_> = (0..4).map(|_| ctx.alloc(TestNode::new_leaf())).collect();
        for (i, k) in kids.iter().enumerate() {
            ctx.relink(a, i, *k);
        }

        child_move_range(&mut ctx, b, 1, a, 2, 2);
        assert_eq!(raw(ctx.get_child(b, 1)), raw(kids[2]));
        assert_eq!(raw(ctx.get_child(b, 2)), raw(kids[3]));
        assert!(ctx.get_child(a, 2).is_null());
        assert!(ctx.get_child(a, 3).is_null());
        assert_eq!(raw(ctx.get_child(a, 0)), raw(kids[0]));
    }
}
