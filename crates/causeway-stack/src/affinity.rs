//! Thread-affinity gate.
//!
//! The cause stack is not a concurrent structure. Instead of a lock, every
//! public operation asserts that it runs on the thread that created the
//! manager, or on the one designated shutdown thread (matched by name).

use std::thread::{self, Thread, ThreadId};

use crate::CauseError;

/// The set of threads permitted to touch a manager.
#[derive(Debug, Clone)]
pub struct ThreadAffinity {
    owner: ThreadId,
    owner_description: String,
    shutdown_thread_name: Option<String>,
}

impl ThreadAffinity {
    /// Bind to the calling thread.
    pub fn current(shutdown_thread_name: Option<String>) -> Self {
        let owner = thread::current();
        Self {
            owner: owner.id(),
            owner_description: describe(&owner),
            shutdown_thread_name,
        }
    }

    /// The owning thread's id.
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Whether the calling thread may use the manager.
    pub fn is_permitted(&self) -> bool {
        let current = thread::current();
        current.id() == self.owner
            || matches!(
                (current.name(), self.shutdown_thread_name.as_deref()),
                (Some(name), Some(shutdown)) if name == shutdown
            )
    }

    /// Fail with [`CauseError::ThreadAffinity`] off the permitted threads.
    pub fn check(&self) -> Result<(), CauseError> {
        if self.is_permitted() {
            return Ok(());
        }
        Err(CauseError::ThreadAffinity {
            current: describe(&thread::current()),
            expected: self.owner_description.clone(),
        })
    }
}

fn describe(thread: &Thread) -> String {
    format!("{} ({:?})", thread.name().unwrap_or("<unnamed>"), thread.id())
}
