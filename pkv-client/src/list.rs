//! # Slot-Arena Ordered List
//!
//! Purpose: Back the pending and in-flight sequences with a structure that
//! supports O(1) push at either end, O(1) pop from the front, and O(1)
//! removal of an arbitrary known element (required for cancellation).
//!
//! ## Design Principles
//! 1. **Stable Handles**: Elements are addressed by slot index plus a
//!    per-slot sequence number, so a handle held across a removal can never
//!    alias a recycled slot.
//! 2. **Intrusive Links**: prev/next indices live in the slots themselves;
//!    no per-node heap allocation after the arena has grown.
//! 3. **Free-List Reuse**: Released slots are recycled before the arena
//!    grows.

const NIL: u32 = u32::MAX;

/// Stable handle to an element in a [`SlotList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeId {
    index: u32,
    seq: u32,
}

impl NodeId {
    /// Packs the handle into a single word, for storage in an atomic.
    pub(crate) fn pack(self) -> u64 {
        (u64::from(self.seq) << 32) | u64::from(self.index)
    }

    /// Reverses [`NodeId::pack`]. Returns `None` for the reserved
    /// "no handle" word.
    pub(crate) fn unpack(word: u64) -> Option<Self> {
        if word == u64::MAX {
            return None;
        }
        Some(NodeId {
            index: word as u32,
            seq: (word >> 32) as u32,
        })
    }
}

struct Slot<T> {
    seq: u32,
    prev: u32,
    next: u32,
    value: Option<T>,
}

/// Doubly linked list over an index-addressed arena.
pub(crate) struct SlotList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: u32,
    tail: u32,
    len: usize,
}

impl<T> SlotList<T> {
    pub(crate) fn new() -> Self {
        SlotList {
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn push_back(&mut self, value: T) -> NodeId {
        let id = self.alloc(value);
        let index = id.index;
        self.slots[index as usize].prev = self.tail;
        self.slots[index as usize].next = NIL;
        match self.tail {
            NIL => self.head = index,
            tail => self.slots[tail as usize].next = index,
        }
        self.tail = index;
        self.len += 1;
        id
    }

    pub(crate) fn push_front(&mut self, value: T) -> NodeId {
        let id = self.alloc(value);
        let index = id.index;
        self.slots[index as usize].prev = NIL;
        self.slots[index as usize].next = self.head;
        match self.head {
            NIL => self.tail = index,
            head => self.slots[head as usize].prev = index,
        }
        self.head = index;
        self.len += 1;
        id
    }

    pub(crate) fn pop_front(&mut self) -> Option<T> {
        let id = self.head_id()?;
        self.remove(id)
    }

    /// Removes the element behind `id`, if the handle is still live.
    ///
    /// A stale handle (its slot was popped or recycled since) is a no-op;
    /// this is what makes late cancellations safe.
    pub(crate) fn remove(&mut self, id: NodeId) -> Option<T> {
        let index = id.index as usize;
        let slot = self.slots.get(index)?;
        if slot.seq != id.seq || slot.value.is_none() {
            return None;
        }

        let (prev, next) = (self.slots[index].prev, self.slots[index].next);
        match prev {
            NIL => self.head = next,
            prev => self.slots[prev as usize].next = next,
        }
        match next {
            NIL => self.tail = prev,
            next => self.slots[next as usize].prev = prev,
        }

        let slot = &mut self.slots[index];
        let value = slot.value.take();
        slot.seq = slot.seq.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        value
    }

    pub(crate) fn head_id(&self) -> Option<NodeId> {
        self.id_at(self.head)
    }

    pub(crate) fn next_id(&self, id: NodeId) -> Option<NodeId> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.seq != id.seq {
            return None;
        }
        self.id_at(slot.next)
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&T> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.seq != id.seq {
            return None;
        }
        slot.value.as_ref()
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut T> {
        let head = self.head;
        if head == NIL {
            return None;
        }
        self.slots[head as usize].value.as_mut()
    }

    fn id_at(&self, index: u32) -> Option<NodeId> {
        if index == NIL {
            return None;
        }
        Some(NodeId {
            index,
            seq: self.slots[index as usize].seq,
        })
    }

    fn alloc(&mut self, value: T) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.value = Some(value);
                NodeId {
                    index,
                    seq: slot.seq,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    seq: 0,
                    prev: NIL,
                    next: NIL,
                    value: Some(value),
                });
                NodeId { index, seq: 0 }
            }
        }
    }
}
