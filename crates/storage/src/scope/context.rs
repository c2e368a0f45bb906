#![forbid(unsafe_code)]

use super::tree::ScopeTree;
use super::{Scope, ScopeInner, ScopeOptions, ScopeProvider};
use crate::ScopeError;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, error};
use uow_core::ids::ScopeId;

pub(crate) struct ContextInner {
    provider: ScopeProvider,
    stack: RefCell<Vec<Rc<ScopeInner>>>,
}

impl ContextInner {
    /// Removes `scope` from the top of the stack.
    pub(crate) fn pop(&self, scope: &Rc<ScopeInner>) -> Result<(), ScopeError> {
        let mut stack = self.stack.borrow_mut();
        match stack.last() {
            Some(top) if Rc::ptr_eq(top, scope) => {
                stack.pop();
                Ok(())
            }
            Some(top) => Err(ScopeError::nesting(
                scope.id(),
                format!("{} is still ambient on top of it", top.id()),
            )),
            None => Err(ScopeError::nesting(scope.id(), "scope stack is empty")),
        }
    }

    /// Finalizes scopes that were dropped out of order and have since
    /// surfaced to the top of the stack.
    pub(crate) fn reap_abandoned(&self) {
        loop {
            let top = {
                let mut stack = self.stack.borrow_mut();
                match stack.last() {
                    Some(top) if top.abandoned.get() => stack.pop(),
                    _ => None,
                }
            };
            let Some(top) = top else {
                break;
            };
            if let Err(err) = top.finalize() {
                error!(scope = %top.id(), error = %err, "abandoned scope failed to dispose");
            }
        }
    }
}

/// The stack of ambient scopes of one logical thread of execution.
///
/// Contexts are cheap: open one per task from the shared
/// [`ScopeProvider`]. A context is not `Send`, so neither its stack nor the
/// scopes created from it can leak into another thread.
pub struct ScopeContext {
    inner: Rc<ContextInner>,
}

impl ScopeContext {
    pub(crate) fn new(provider: ScopeProvider) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                provider,
                stack: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn provider(&self) -> &ScopeProvider {
        &self.inner.provider
    }

    /// Creates a scope and makes it ambient. With an ambient scope present,
    /// the new scope joins its tree; otherwise it roots a new tree with its
    /// own connection and transaction.
    pub fn create_scope(&self, options: ScopeOptions) -> Result<Scope, ScopeError> {
        let parent = self.inner.stack.borrow().last().cloned();
        let inner = match parent {
            Some(parent) => {
                parent.tree.join(&options)?;
                ScopeInner::nested(&parent, &options)
            }
            None => ScopeInner::root(self.open_tree(&options)?, &options, false),
        };
        let inner = Rc::new(inner);
        self.inner.stack.borrow_mut().push(Rc::clone(&inner));

        debug!(
            scope = %inner.id,
            parent = ?inner.parent,
            tree = %inner.tree.id(),
            depth = self.depth(),
            "scope created"
        );
        Ok(Scope {
            inner,
            context: Rc::clone(&self.inner),
        })
    }

    /// Creates a root scope that is not ambient. It must be attached before
    /// it can take locks or touch the database.
    pub fn create_detached_scope(&self, options: ScopeOptions) -> Result<Scope, ScopeError> {
        let inner = Rc::new(ScopeInner::root(self.open_tree(&options)?, &options, true));
        debug!(scope = %inner.id, tree = %inner.tree.id(), "detached scope created");
        Ok(Scope {
            inner,
            context: Rc::clone(&self.inner),
        })
    }

    pub fn attach_scope(&self, scope: &Scope) -> Result<(), ScopeError> {
        let inner = &scope.inner;
        if !Rc::ptr_eq(&scope.context, &self.inner) {
            return Err(ScopeError::nesting(inner.id, "scope belongs to another context"));
        }
        if !inner.detached {
            return Err(ScopeError::nesting(inner.id, "only detached scopes can be attached"));
        }
        if inner.disposed.get() {
            return Err(ScopeError::nesting(inner.id, "scope has been disposed"));
        }
        if inner.attached.get() {
            return Err(ScopeError::nesting(inner.id, "scope is already attached"));
        }

        inner.attached.set(true);
        self.inner.stack.borrow_mut().push(Rc::clone(inner));
        debug!(scope = %inner.id, depth = self.depth(), "detached scope attached");
        Ok(())
    }

    /// Pops the ambient scope, which must be an attached detached scope, and
    /// returns its id. The scope stays alive and can be attached again.
    pub fn detach_scope(&self) -> Result<ScopeId, ScopeError> {
        let mut stack = self.inner.stack.borrow_mut();
        let Some(top) = stack.last() else {
            return Err(ScopeError::InvalidInput("no ambient scope to detach".to_string()));
        };
        if !top.detached {
            return Err(ScopeError::nesting(
                top.id,
                "ambient scope was not attached and cannot be detached",
            ));
        }
        let id = top.id;
        top.attached.set(false);
        stack.pop();
        drop(stack);
        debug!(scope = %id, "detached scope detached");
        Ok(id)
    }

    /// Id of the scope on top of the stack.
    pub fn ambient_scope_id(&self) -> Option<ScopeId> {
        self.inner.stack.borrow().last().map(|scope| scope.id)
    }

    pub fn depth(&self) -> usize {
        self.inner.stack.borrow().len()
    }

    /// Ids on the stack, outermost first.
    pub fn stack_ids(&self) -> Vec<ScopeId> {
        self.inner.stack.borrow().iter().map(|scope| scope.id).collect()
    }

    fn open_tree(&self, options: &ScopeOptions) -> Result<Rc<ScopeTree>, ScopeError> {
        let provider = &self.inner.provider;
        let conn = provider.connect()?;
        Ok(Rc::new(ScopeTree::new(
            conn,
            options,
            provider.settings(),
            provider.locking(),
        )))
    }
}

impl std::fmt::Debug for ScopeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeContext")
            .field("stack", &self.stack_ids())
            .finish()
    }
}
