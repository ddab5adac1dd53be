//! Timer min-heap.
//!
//! A binary min-heap of timer records keyed by absolute expiry, stored as
//! a vector of handles. Each record remembers its own heap index so that
//! restarting or removing an arbitrary timer repositions it in O(log n).

use slab::Slab;

use super::record::{Ev, EvRecord};

pub(crate) const NO_POS: usize = usize::MAX;

#[inline]
fn expiry(records: &Slab<EvRecord>, ev: Ev) -> u64 {
    records[ev.key].timer().expiry
}

#[inline]
fn set_pos(records: &mut Slab<EvRecord>, heap: &mut [Ev], pos: usize, ev: Ev) {
    heap[pos] = ev;
    records[ev.key].timer_mut().heap_pos = pos;
}

pub(crate) fn sift_up(records: &mut Slab<EvRecord>, heap: &mut [Ev], mut pos: usize) {
    let ev = heap[pos];
    let key = expiry(records, ev);

    while pos > 0 {
        let parent = (pos - 1) / 2;
        let pev = heap[parent];
        if expiry(records, pev) <= key {
            break;
        }
        set_pos(records, heap, pos, pev);
        pos = parent;
    }
    set_pos(records, heap, pos, ev);
}

pub(crate) fn sift_down(records: &mut Slab<EvRecord>, heap: &mut [Ev], mut pos: usize) {
    let ev = heap[pos];
    let key = expiry(records, ev);

    loop {
        let mut child = 2 * pos + 1;
        if child >= heap.len() {
            break;
        }
        if child + 1 < heap.len()
            && expiry(records, heap[child + 1]) < expiry(records, heap[child])
        {
            child += 1;
        }
        let cev = heap[child];
        if key <= expiry(records, cev) {
            break;
        }
        set_pos(records, heap, pos, cev);
        pos = child;
    }
    set_pos(records, heap, pos, ev);
}

/// Re-establish the heap invariant around a record whose expiry changed.
pub(crate) fn fix(records: &mut Slab<EvRecord>, heap: &mut [Ev], ev: Ev) {
    let pos = records[ev.key].timer().heap_pos;
    if pos > 0 && expiry(records, heap[(pos - 1) / 2]) >= expiry(records, ev) {
        sift_up(records, heap, pos);
    } else {
        sift_down(records, heap, pos);
    }
}

pub(crate) fn insert(records: &mut Slab<EvRecord>, heap: &mut Vec<Ev>, ev: Ev) {
    heap.push(ev);
    let pos = heap.len() - 1;
    records[ev.key].timer_mut().heap_pos = pos;
    sift_up(records, heap, pos);
}

pub(crate) fn remove(records: &mut Slab<EvRecord>, heap: &mut Vec<Ev>, ev: Ev) {
    let pos = records[ev.key].timer().heap_pos;
    debug_assert_ne!(pos, NO_POS, "timer is not on the heap");
    let last = heap.pop().expect("heap is empty");
    if last != ev {
        set_pos(records, heap, pos, last);
        fix(records, heap, last);
    }
    records[ev.key].timer_mut().heap_pos = NO_POS;
}
