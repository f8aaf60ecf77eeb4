// Intrusive doubly-linked list implementation
//
// Nodes live inside the TCBs (two per task) and are addressed by index, so a
// list is just a head/tail pair plus bookkeeping. Every node records which
// list it is in, which is what makes O(1) removal possible without knowing
// the list up front.

/// Index of a node inside a [`NodeStore`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeRef(u16);

impl NodeRef {
    pub const fn new(raw: usize) -> Self {
        NodeRef(raw as u16)
    }

    pub const fn raw(self) -> usize {
        self.0 as usize
    }
}

/// Identity of every list a node can be linked into
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ListId {
    Ready(u8),
    /// One of the two wake-time lists; which one is "current" flips on tick
    /// counter overflow
    Delayed(u8),
    /// Unblocked while the scheduler was suspended
    PendingReady,
    Suspended,
    /// Blocked on an event with an infinite timeout
    BlockedForever,
    /// Deleted while running, waiting for the idle task
    Terminating,
    SendWaiters(u16),
    RecvWaiters(u16),
}

/// List node that lives inside the data structure
#[derive(Copy, Clone, Debug, Default)]
pub struct ListNode {
    next: Option<NodeRef>,
    prev: Option<NodeRef>,
    /// The containing list
    container: Option<ListId>,
    /// Sort value (wake tick or inverted priority). Lower values appear
    /// earlier in ordered lists.
    value: u32,
}

impl ListNode {
    pub const fn new() -> Self {
        ListNode {
            next: None,
            prev: None,
            container: None,
            value: 0,
        }
    }

    pub fn set_value(&mut self, value: u32) {
        self.value = value;
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn is_in_list(&self) -> bool {
        self.container.is_some()
    }

    pub fn container(&self) -> Option<ListId> {
        self.container
    }

    pub fn next(&self) -> Option<NodeRef> {
        self.next
    }

    pub fn prev(&self) -> Option<NodeRef> {
        self.prev
    }
}

/// Backing storage the list links point into
pub trait NodeStore {
    fn node(&self, r: NodeRef) -> &ListNode;
    fn node_mut(&mut self, r: NodeRef) -> &mut ListNode;
}

impl NodeStore for [ListNode] {
    fn node(&self, r: NodeRef) -> &ListNode {
        &self[r.raw()]
    }

    fn node_mut(&mut self, r: NodeRef) -> &mut ListNode {
        &mut self[r.raw()]
    }
}

#[derive(Debug)]
pub struct List {
    id: ListId,
    length: usize,
    head: Option<NodeRef>,
    tail: Option<NodeRef>,
    /// Traversal cursor used by `next_cursor`
    index: Option<NodeRef>,
    /// Last node placed by `insert_sorted`
    hint: Option<NodeRef>,
}

impl List {
    pub const fn new(id: ListId) -> Self {
        List {
            id,
            length: 0,
            head: None,
            tail: None,
            index: None,
            hint: None,
        }
    }

    /// Insert in ascending `value` order, after any nodes with an equal value
    ///
    /// The scan starts at the previous insertion point when that node sorts
    /// at or before the new one, so runs of equal keys stay O(1).
    pub fn insert_sorted<N: NodeStore + ?Sized>(&mut self, nodes: &mut N, item: NodeRef) {
        let item_value = nodes.node(item).value;

        let mut iterator = match self.hint {
            Some(hint) if nodes.node(hint).value <= item_value => nodes.node(hint).next,
            _ => self.head,
        };

        while let Some(at) = iterator {
            if nodes.node(at).value > item_value {
                break;
            }
            iterator = nodes.node(at).next;
        }

        match iterator {
            Some(before) => self.link_before(nodes, item, before),
            None => self.link_end(nodes, item),
        }
        self.hint = Some(item);
    }

    /// Insert item at end of list (O(1))
    pub fn insert_end<N: NodeStore + ?Sized>(&mut self, nodes: &mut N, item: NodeRef) {
        self.link_end(nodes, item);
    }

    fn link_end<N: NodeStore + ?Sized>(&mut self, nodes: &mut N, item: NodeRef) {
        debug_assert!(!nodes.node(item).is_in_list(), "node already linked");

        let old_tail = self.tail;
        {
            let node = nodes.node_mut(item);
            node.prev = old_tail;
            node.next = None;
            node.container = Some(self.id);
        }
        match old_tail {
            Some(tail) => nodes.node_mut(tail).next = Some(item),
            None => self.head = Some(item),
        }
        self.tail = Some(item);
        self.length += 1;
    }

    fn link_before<N: NodeStore + ?Sized>(&mut self, nodes: &mut N, item: NodeRef, before: NodeRef) {
        debug_assert!(!nodes.node(item).is_in_list(), "node already linked");

        let prev = nodes.node(before).prev;
        {
            let node = nodes.node_mut(item);
            node.prev = prev;
            node.next = Some(before);
            node.container = Some(self.id);
        }
        nodes.node_mut(before).prev = Some(item);
        match prev {
            Some(prev) => nodes.node_mut(prev).next = Some(item),
            None => self.head = Some(item),
        }
        self.length += 1;
    }

    /// Remove item from list
    ///
    /// Returns the number of items left in the list.
    pub fn remove<N: NodeStore + ?Sized>(&mut self, nodes: &mut N, item: NodeRef) -> usize {
        let ListNode {
            next,
            prev,
            container,
            ..
        } = *nodes.node(item);
        assert_eq!(container, Some(self.id), "node is not in this list");

        // The cursor marks the last node visited; stepping it back keeps the
        // walk on the node that followed the removed one
        if self.index == Some(item) {
            self.index = prev;
        }
        if self.hint == Some(item) {
            self.hint = prev;
        }

        match prev {
            Some(prev) => nodes.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => nodes.node_mut(next).prev = prev,
            None => self.tail = prev,
        }

        let node = nodes.node_mut(item);
        node.next = None;
        node.prev = None;
        node.container = None;

        self.length -= 1;
        self.length
    }

    /// Advance the traversal cursor, wrapping at the end
    pub fn next_cursor<N: NodeStore + ?Sized>(&mut self, nodes: &N) -> Option<NodeRef> {
        self.index = match self.index {
            Some(at) => nodes.node(at).next.or(self.head),
            None => self.head,
        };
        self.index
    }

    /// Get head item (first item)
    pub fn head(&self) -> Option<NodeRef> {
        self.head
    }

    pub fn tail(&self) -> Option<NodeRef> {
        self.tail
    }

    /// Check if list is empty
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Get number of items in list
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn iter<'a, N: NodeStore + ?Sized>(&self, nodes: &'a N) -> Iter<'a, N> {
        Iter {
            nodes,
            at: self.head,
        }
    }
}

pub struct Iter<'a, N: NodeStore + ?Sized> {
    nodes: &'a N,
    at: Option<NodeRef>,
}

impl<N: NodeStore + ?Sized> Iterator for Iter<'_, N> {
    type Item = NodeRef;

    fn next(&mut self) -> Option<NodeRef> {
        let at = self.at?;
        self.at = self.nodes.node(at).next;
        Some(at)
    }
}
