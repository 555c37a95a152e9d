// SPDX-License-Identifier: CEPL-1.0
//! Ordered layer collection.
//!
//! Layers are stored in registration order. Events and command recording walk
//! the stack from the most recently pushed layer down, so overlays registered
//! last see input first.

pub struct LayerStack<L: ?Sized> {
    layers: Vec<Box<L>>,
}

impl<L: ?Sized> Default for LayerStack<L> {
    fn default() -> Self {
        Self { layers: Vec::new() }
    }
}

impl<L: ?Sized> LayerStack<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, layer: Box<L>) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Drops every layer, topmost first.
    pub fn clear(&mut self) {
        while self.layers.pop().is_some() {}
    }

    /// Registration order. Used for update ticks.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut L> + '_ {
        self.layers.iter_mut().map(|l| &mut **l)
    }

    /// Most recently pushed first. Used for events and command recording.
    pub fn iter_top_down_mut(&mut self) -> impl Iterator<Item = &mut L> + '_ {
        self.layers.iter_mut().rev().map(|l| &mut **l)
    }

    /// Offers something to each layer, topmost first, until `handle` returns
    /// true. Returns the registration index of the consuming layer.
    pub fn dispatch<F>(&mut self, mut handle: F) -> Option<usize>
    where
        F: FnMut(&mut L) -> bool,
    {
        let count = self.layers.len();
        for (depth, layer) in self.layers.iter_mut().rev().enumerate() {
            if handle(&mut **layer) {
                return Some(count - 1 - depth);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use std::cell::RefCell;
    use std::rc::Rc;

    trait Probe {
        fn on_event(&mut self, event: &Event) -> bool;
    }

    struct Named {
        name: &'static str,
        consumes: bool,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Probe for Named {
        fn on_event(&mut self, _event: &Event) -> bool {
            self.log.borrow_mut().push(self.name);
            self.consumes
        }
    }

    fn stack(consuming: &[&'static str]) -> (LayerStack<dyn Probe>, Rc<RefCell<Vec<&'static str>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut stack: LayerStack<dyn Probe> = LayerStack::new();
        for name in ["A", "B", "C"] {
            stack.push(Box::new(Named {
                name,
                consumes: consuming.contains(&name),
                log: log.clone(),
            }));
        }
        (stack, log)
    }

    #[test]
    fn events_reach_topmost_first() {
        let (mut stack, log) = stack(&[]);
        let consumed = stack.dispatch(|l| l.on_event(&Event::WindowClose));
        assert_eq!(consumed, None);
        assert_eq!(*log.borrow(), vec!["C", "B", "A"]);
    }

    #[test]
    fn consumed_event_stops_propagation() {
        let (mut stack, log) = stack(&["B"]);
        let consumed = stack.dispatch(|l| l.on_event(&Event::KeyTyped('x')));
        assert_eq!(consumed, Some(1));
        assert_eq!(*log.borrow(), vec!["C", "B"]);
    }

    #[test]
    fn update_order_is_registration_order() {
        let (mut stack, log) = stack(&[]);
        for layer in stack.iter_mut() {
            layer.on_event(&Event::WindowClose);
        }
        assert_eq!(*log.borrow(), vec!["A", "B", "C"]);

        log.borrow_mut().clear();
        for layer in stack.iter_top_down_mut() {
            layer.on_event(&Event::WindowClose);
        }
        assert_eq!(*log.borrow(), vec!["C", "B", "A"]);
    }

    #[test]
    fn clear_empties_stack() {
        let (mut stack, _) = stack(&[]);
        assert_eq!(stack.len(), 3);
        stack.clear();
        assert!(stack.is_empty());
    }
}
