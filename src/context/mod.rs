//! Execution-scoped context propagation.
//!
//! A [`Context`] is an immutable envelope flowing with a unit of work. It
//! carries named, typed entries, most prominently the current [`Span`],
//! plus a user [`TagSet`]. Write operations produce new contexts; attaching a
//! context to the current thread makes it visible through
//! [`Context::current`] until the returned guard drops.

use std::any::Any;
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::tag::{TagSet, TagValue};
use crate::trace::Span;
use crate::vantage_warn;

thread_local! {
    static CURRENT_CONTEXT: RefCell<ContextStack> = RefCell::new(ContextStack::default());
}

/// The distinguished key carrying the current [`Span`]. Its default is the
/// empty span.
pub static SPAN_KEY: Lazy<ContextKey<Span>> = Lazy::new(|| ContextKey::new("span", Span::empty()));

/// A named handle identifying one typed slot in a [`Context`], together with
/// the value returned when the slot is absent.
///
/// Keys with the same name address the same slot; create each key once and
/// share it (typically through a `static`).
pub struct ContextKey<T> {
    name: Cow<'static, str>,
    default: T,
}

impl<T: Clone + Send + Sync + 'static> ContextKey<T> {
    /// Creates a key with the given name and absent-value default.
    pub fn new(name: impl Into<Cow<'static, str>>, default: T) -> ContextKey<T> {
        ContextKey {
            name: name.into(),
            default,
        }
    }

    /// The key name. Keys are identified by name across propagation channels.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextKey({})", self.name)
    }
}

type EntryMap = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// An immutable envelope of named entries and tags that flows with a unit of
/// work, in-process and across process boundaries.
#[derive(Clone, Default)]
pub struct Context {
    entries: Option<Arc<EntryMap>>,
    tags: TagSet,
}

impl Context {
    /// Creates an empty context. Does not allocate.
    pub fn new() -> Context {
        Context::default()
    }

    /// Creates a context holding a single entry.
    pub fn of<T: Clone + Send + Sync + 'static>(key: &ContextKey<T>, value: T) -> Context {
        Context::new().with_entry(key, value)
    }

    /// Returns the value stored under `key`, or the key's default when the
    /// slot is absent or holds a value of an unexpected type.
    pub fn get<'a, T: Clone + Send + Sync + 'static>(&'a self, key: &'a ContextKey<T>) -> &'a T {
        self.entries
            .as_ref()
            .and_then(|entries| entries.get(key.name.as_ref()))
            .and_then(|value| value.downcast_ref::<T>())
            .unwrap_or(&key.default)
    }

    /// Returns a copy of this context with `value` stored under `key`.
    pub fn with_entry<T: Clone + Send + Sync + 'static>(
        &self,
        key: &ContextKey<T>,
        value: T,
    ) -> Context {
        let mut entries = self
            .entries
            .as_ref()
            .map(|current| (**current).clone())
            .unwrap_or_default();
        entries.insert(key.name.to_string(), Arc::new(value));
        Context {
            entries: Some(Arc::new(entries)),
            tags: self.tags.clone(),
        }
    }

    /// The tags carried by this context.
    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// Returns a copy of this context with one tag added.
    pub fn with_tag(&self, key: impl Into<String>, value: impl Into<TagValue>) -> Context {
        Context {
            entries: self.entries.clone(),
            tags: self.tags.with(key, value),
        }
    }

    /// Returns a copy of this context with `tags` merged in; incoming tags
    /// win on key collisions.
    pub fn with_tags(&self, tags: TagSet) -> Context {
        Context {
            entries: self.entries.clone(),
            tags: self.tags.merge(&tags),
        }
    }

    /// The current span, or the empty span when none is set.
    pub fn span(&self) -> &Span {
        self.get(&SPAN_KEY)
    }

    /// Returns a copy of this context with the given span as its current span.
    pub fn with_span(&self, span: Span) -> Context {
        self.with_entry(&SPAN_KEY, span)
    }

    /// Returns a snapshot of the calling thread's current context.
    pub fn current() -> Context {
        Self::map_current(|cx| cx.clone())
    }

    /// Applies `f` to the calling thread's current context without cloning it.
    pub fn map_current<T>(f: impl FnOnce(&Context) -> T) -> T {
        CURRENT_CONTEXT.with(|stack| stack.borrow().map_current(f))
    }

    /// Makes this context the calling thread's current context until the
    /// returned guard drops, restoring the previous one.
    pub fn attach(self) -> ContextGuard {
        let pos = CURRENT_CONTEXT.with(|stack| stack.borrow_mut().push(self));
        ContextGuard {
            pos,
            _not_send: PhantomData,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("entries", &self.entries.as_ref().map_or(0, |e| e.len()))
            .field("tags", &self.tags)
            .finish()
    }
}

/// Restores the previously attached context when dropped.
#[derive(Debug)]
pub struct ContextGuard {
    pos: usize,
    // Guards rely on thread-local state and must not cross threads.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if self.pos > 0 {
            CURRENT_CONTEXT.with(|stack| stack.borrow_mut().pop(self.pos));
        }
    }
}

/// Tracks the contexts attached to one thread. Guards may be dropped out of
/// order; only popping the top slot restores an earlier context, inner slots
/// are tombstoned until the stack shrinks past them.
struct ContextStack {
    current: Context,
    stack: Vec<Option<Context>>,
}

impl ContextStack {
    fn push(&mut self, context: Context) -> usize {
        let previous = std::mem::replace(&mut self.current, context);
        self.stack.push(Some(previous));
        self.stack.len()
    }

    fn pop(&mut self, pos: usize) {
        let len = self.stack.len();
        if pos > len {
            vantage_warn!(name: "Context.PopOutOfBounds", position = pos, stack_length = len);
            return;
        }
        if pos == len {
            while let Some(None) = self.stack.last() {
                self.stack.pop();
            }
            if let Some(Some(previous)) = self.stack.pop() {
                self.current = previous;
            }
        } else {
            // Out-of-order drop: the context attached by this guard was saved
            // at slot `pos` when the next guard pushed. Tombstone it so later
            // restores skip over it.
            self.stack[pos] = None;
        }
    }

    fn map_current<T>(&self, f: impl FnOnce(&Context) -> T) -> T {
        f(&self.current)
    }
}

impl Default for ContextStack {
    fn default() -> Self {
        ContextStack {
            current: Context::default(),
            stack: Vec::with_capacity(8),
        }
    }
}
