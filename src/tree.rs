/*!
The [`EventTree`] type.

Batches of events arrive in the order they were stopped, so children show up before their parents. An event tree indexes a batch by parent so it can be walked from the roots down.
*/

use std::collections::HashMap;

use crate::event::{Event, EventId};

/**
A view over a batch of events as a forest of parent/child trees.

Events whose parent isn't part of the batch are treated as roots.
*/
pub struct EventTree<'a> {
    events: &'a [Event],
    roots: Vec<usize>,
    children: HashMap<EventId, Vec<usize>>,
}

impl<'a> EventTree<'a> {
    /**
    Index a batch of events.
    */
    pub fn new(events: &'a [Event]) -> Self {
        let index: HashMap<EventId, usize> = events
            .iter()
            .enumerate()
            .map(|(i, evt)| (evt.id(), i))
            .collect();

        let mut roots = Vec::new();
        let mut children: HashMap<EventId, Vec<usize>> = HashMap::new();

        for (i, evt) in events.iter().enumerate() {
            match evt.parent_id() {
                Some(parent) if index.contains_key(&parent) => {
                    children.entry(parent).or_default().push(i)
                }
                _ => roots.push(i),
            }
        }

        EventTree {
            events,
            roots,
            children,
        }
    }

    /**
    The events with no parent in the batch, in batch order.
    */
    pub fn roots(&self) -> impl Iterator<Item = Node<'_, 'a>> + '_ {
        self.roots.iter().map(move |&i| Node {
            tree: self,
            index: i,
            depth: 0,
        })
    }

    /**
    Visit every event depth-first, parents before their children.
    */
    pub fn walk(&self, mut visit: impl FnMut(usize, &'a Event)) {
        fn walk_node<'t, 'a>(node: Node<'t, 'a>, visit: &mut impl FnMut(usize, &'a Event)) {
            visit(node.depth(), node.event());

            for child in node.children() {
                walk_node(child, visit);
            }
        }

        for root in self.roots() {
            walk_node(root, &mut visit);
        }
    }

    /**
    The total number of events in the batch.
    */
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /**
    Whether the batch is empty.
    */
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/**
An event in an [`EventTree`].
*/
#[derive(Clone, Copy)]
pub struct Node<'t, 'a> {
    tree: &'t EventTree<'a>,
    index: usize,
    depth: usize,
}

impl<'t, 'a> Node<'t, 'a> {
    /**
    The event at this node.
    */
    pub fn event(&self) -> &'a Event {
        &self.tree.events[self.index]
    }

    /**
    How far this node is from its root.
    */
    pub fn depth(&self) -> usize {
        self.depth
    }

    /**
    The children of this event in the batch, in the order they were stopped.
    */
    pub fn children(&self) -> impl Iterator<Item = Node<'t, 'a>> + 't {
        let tree = self.tree;
        let depth = self.depth + 1;

        tree.children
            .get(&tree.events[self.index].id())
            .into_iter()
            .flatten()
            .map(move |&i| Node {
                tree,
                index: i,
                depth,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_before_parents() {
        let root = Event::new("test", "root");
        let child_a = Event::with_parent("test", "a", Some(root.to_ref()));
        let grandchild = Event::with_parent("test", "a.1", Some(child_a.to_ref()));
        let child_b = Event::with_parent("test", "b", Some(root.to_ref()));

        // Stop order
        let batch = vec![grandchild, child_a, child_b, root];
        let tree = EventTree::new(&batch);

        let mut visited = Vec::new();
        tree.walk(|depth, evt| visited.push((depth, evt.name().to_owned())));

        assert_eq!(
            vec![
                (0, "root".to_owned()),
                (1, "a".to_owned()),
                (2, "a.1".to_owned()),
                (1, "b".to_owned()),
            ],
            visited
        );
    }

    #[test]
    fn missing_parents_become_roots() {
        let root = Event::new("test", "root");
        let child = Event::with_parent("test", "child", Some(root.to_ref()));

        let batch = vec![child];
        let tree = EventTree::new(&batch);

        let roots: Vec<_> = tree.roots().map(|node| node.event().name()).collect();

        assert_eq!(vec!["child"], roots);
    }
}
