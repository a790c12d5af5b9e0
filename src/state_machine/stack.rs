//! Bounded LIFO stack used for the interrupt and captcha-context stacks

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_DEPTH: usize = 32;

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stack depth limit of {max_depth} reached")]
pub struct StackOverflow {
    pub max_depth: usize,
}

/// A stack with an explicit maximum depth.
///
/// `push` fails instead of growing past `max_depth`, which surfaces
/// suspend/resume imbalance as an error rather than unbounded growth.
/// `pop` and `peek` on an empty stack return `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundedStack<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default = "default_max_depth")]
    max_depth: usize,
}

impl<T> Default for BoundedStack<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl<T> BoundedStack<T> {
    pub fn new(max_depth: usize) -> Self {
        Self {
            items: Vec::new(),
            max_depth,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Stored sessions keep the limit they were created with; this applies
    /// the currently configured one.
    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
    }

    pub fn push(&mut self, item: T) -> Result<(), StackOverflow> {
        if self.items.len() >= self.max_depth {
            return Err(StackOverflow {
                max_depth: self.max_depth,
            });
        }
        self.items.push(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    #[allow(dead_code)] // Used in tests
    pub fn peek(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[allow(dead_code)] // Used in tests
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate bottom to top
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Remove the topmost item matching `pred`, returning its former index
    /// (counted from the bottom) and the item.
    pub fn remove_where(&mut self, pred: impl Fn(&T) -> bool) -> Option<(usize, T)> {
        let index = self.items.iter().rposition(pred)?;
        Some((index, self.items.remove(index)))
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)
    }
}
