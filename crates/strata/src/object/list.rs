//! Bounded walks of intrusive doubly-linked lists.
//!
//! Kernel lists link containers through an embedded link struct
//! (`LIST_ENTRY`, `list_head`). Each step reads the link's forward pointer
//! and subtracts the link field's offset to get the next container. A walk
//! stops at a null pointer, at any link address it has already visited
//! (which includes returning to the head) and after `max_entries`.

use crate::object::error::{ObjectError, ObjectResult};
use crate::object::typed::TypedObject;
use isf::TypeDescriptor;
use std::collections::HashSet;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

#[derive(Debug, Clone)]
pub struct ListWalker {
    container: String,
    link_field: String,
    next_field: String,
    max_entries: usize,
}

impl ListWalker {
    /// Walk `container` objects linked through their `link_field` member.
    pub fn new(container: impl Into<String>, link_field: impl Into<String>) -> Self {
        ListWalker {
            container: container.into(),
            link_field: link_field.into(),
            next_field: "next".to_string(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    /// Name of the forward pointer in the link struct (`Flink` on Windows).
    pub fn next_field(mut self, name: impl Into<String>) -> Self {
        self.next_field = name.into();
        self
    }

    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Start a walk. `start` is either a list head (a bare link struct) or
    /// a container, which is then yielded first.
    pub fn walk(&self, start: &TypedObject) -> ObjectResult<ListIter> {
        let profile = start.profile();
        let container = profile
            .struct_type(&self.container)
            .ok_or_else(|| ObjectError::UnknownType(self.container.clone()))?;
        let link_offset = container
            .field(&self.link_field)
            .ok_or_else(|| ObjectError::UnknownField {
                type_name: self.container.clone(),
                field: self.link_field.clone(),
            })?
            .offset;

        let is_container = matches!(
            start.resolved()?,
            TypeDescriptor::Struct(st) if st.name == self.container
        );
        let (head, first) = if is_container {
            (start.field(&self.link_field)?, Some(start.clone()))
        } else {
            (start.clone(), None)
        };
        // Fail early on a head without the forward pointer.
        head.field(&self.next_field)?;

        let mut visited = HashSet::new();
        visited.insert(head.offset());
        Ok(ListIter {
            walker: self.clone(),
            link_offset,
            cursor: Some(head),
            first,
            visited,
            yielded: 0,
        })
    }
}

/// Containers of one list walk, lazily.
pub struct ListIter {
    walker: ListWalker,
    link_offset: u64,
    /// Link whose forward pointer is followed next.
    cursor: Option<TypedObject>,
    first: Option<TypedObject>,
    visited: HashSet<u64>,
    yielded: usize,
}

impl ListIter {
    fn step(&mut self) -> Option<TypedObject> {
        let link = self.cursor.take()?;
        let next = match link.field(&self.walker.next_field).and_then(|p| p.pointer_value()) {
            Ok(addr) => addr,
            Err(e) => {
                debug!("List walk stopped at {:#x}: {}", link.offset(), e);
                return None;
            }
        };
        if next == 0 {
            return None;
        }
        if !self.visited.insert(next) {
            debug!("List walk closed at {:#x}", next);
            return None;
        }

        let container_addr = next.wrapping_sub(self.link_offset);
        let container = TypedObject::from_type_name(
            link.space().clone(),
            link.profile().clone(),
            &self.walker.container,
            container_addr,
        )
        .ok()?;
        if !container.is_valid() {
            debug!("List walk stopped at unmapped entry {:#x}", container_addr);
            return None;
        }
        self.cursor = container.field(&self.walker.link_field).ok();
        Some(container)
    }
}

impl Iterator for ListIter {
    type Item = TypedObject;

    fn next(&mut self) -> Option<TypedObject> {
        if self.yielded >= self.walker.max_entries {
            if self.cursor.take().is_some() {
                warn!(
                    "List walk of {} hit the {} entry limit",
                    self.walker.container, self.walker.max_entries
                );
            }
            return None;
        }
        let item = match self.first.take() {
            Some(first) => Some(first),
            None => self.step(),
        };
        if item.is_some() {
            self.yielded += 1;
        }
        item
    }
}
