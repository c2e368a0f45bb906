#![forbid(unsafe_code)]

pub mod locks;
pub mod options;

pub mod ids {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);
    static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

    /// Opaque identity of one scope. Never reused within a process.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ScopeId(u64);

    impl ScopeId {
        pub fn next() -> Self {
            Self(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
        }

        pub fn get(self) -> u64 {
            self.0
        }
    }

    impl std::fmt::Display for ScopeId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "scope#{}", self.0)
        }
    }

    /// Identity of a scope tree, i.e. of the one physical transaction its
    /// scopes share. Lock ownership is tracked per tree.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct TreeId(u64);

    impl TreeId {
        pub fn next() -> Self {
            Self(NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed))
        }

        pub fn get(self) -> u64 {
            self.0
        }
    }

    impl std::fmt::Display for TreeId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "tree#{}", self.0)
        }
    }
}

pub use locks::{LockEntry, LockId, LockIdError, LockMode};
pub use options::{IsolationLevel, OptionParseError, RepositoryCacheMode};
