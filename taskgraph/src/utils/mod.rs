pub(crate) mod closable_stack;
pub(crate) use closable_stack::ClosableStack;

pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;

pub(crate) mod thread;
