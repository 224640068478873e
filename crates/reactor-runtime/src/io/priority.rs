//! Process-wide I/O priority classes
//!
//! A class is a name plus shares. Ids are process-wide so a request
//! marshalled to another shard's io coordinator keeps its class; each io
//! queue creates its per-class state lazily on first use.

use reactor_core::{ReactorError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

pub const MAX_PRIORITY_CLASSES: usize = 32;

/// Handle to a registered priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PriorityClass(u32);

impl PriorityClass {
    #[inline]
    pub fn id(self) -> u32 {
        self.0
    }

    pub fn shares(self) -> u32 {
        CLASSES.shares(self.0)
    }

    pub fn name(self) -> &'static str {
        CLASSES.name(self.0)
    }
}

impl Default for PriorityClass {
    fn default() -> Self {
        default_priority_class()
    }
}

pub(crate) struct ClassTable {
    shares: [AtomicU32; MAX_PRIORITY_CLASSES],
    names: [OnceLock<&'static str>; MAX_PRIORITY_CLASSES],
}

impl ClassTable {
    pub const fn new() -> Self {
        Self {
            shares: [const { AtomicU32::new(0) }; MAX_PRIORITY_CLASSES],
            names: [const { OnceLock::new() }; MAX_PRIORITY_CLASSES],
        }
    }

    /// Claim the first free slot after the reserved default one.
    pub fn register(&self, name: &str, shares: u32) -> Result<PriorityClass> {
        let shares = shares.max(1);
        for i in 1..MAX_PRIORITY_CLASSES {
            if self.shares[i]
                .compare_exchange(0, shares, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let _ = self.names[i].set(Box::leak(name.to_string().into_boxed_str()));
                return Ok(PriorityClass(i as u32));
            }
        }
        Err(ReactorError::TooManyPriorityClasses)
    }

    pub fn shares(&self, id: u32) -> u32 {
        if id == 0 {
            return 1;
        }
        self.shares
            .get(id as usize)
            .map(|s| s.load(Ordering::Acquire))
            .unwrap_or(1)
            .max(1)
    }

    pub fn name(&self, id: u32) -> &'static str {
        if id == 0 {
            return "default";
        }
        self.names.get(id as usize).and_then(|n| n.get().copied()).unwrap_or("unnamed")
    }
}

static CLASSES: ClassTable = ClassTable::new();

/// Register a class. Fails once all slots are taken; classes live for the
/// rest of the process.
pub fn register_priority_class(name: &str, shares: u32) -> Result<PriorityClass> {
    let pc = CLASSES.register(name, shares)?;
    reactor_core::kdebug!("priority class {} '{}' shares {}", pc.0, name, shares.max(1));
    Ok(pc)
}

/// The class requests get when the caller names none.
pub fn default_priority_class() -> PriorityClass {
    PriorityClass(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_until_full() {
        let table = ClassTable::new();
        let a = table.register("commitlog", 1000).unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(table.shares(1), 1000);
        assert_eq!(table.name(1), "commitlog");
        for i in 2..MAX_PRIORITY_CLASSES {
            assert_eq!(table.register("x", 1).unwrap().id(), i as u32);
        }
        assert_eq!(table.register("one-too-many", 1), Err(ReactorError::TooManyPriorityClasses));
    }

    #[test]
    fn test_default_class() {
        let table = ClassTable::new();
        assert_eq!(table.shares(0), 1);
        assert_eq!(table.name(0), "default");
        assert_eq!(default_priority_class().name(), "default");
        assert_eq!(table.register("zero", 0).map(|c| table.shares(c.id())), Ok(1));
    }
}
