//! Unique resource name generation
//!
//! Wrappers take a [`ResourceNamer`] instead of reaching for a process-wide
//! generator, so tests can inject [`SequentialNamer`] and get stable names.

use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// Produces names that are unique enough to be used for new ARM resources.
pub trait ResourceNamer: Send + Sync {
    /// Return a name starting with `prefix` that is at most `max_len` characters.
    fn unique_name(&self, prefix: &str, max_len: usize) -> String;
}

/// Random suffix namer backed by v4 UUIDs
#[derive(Debug, Clone, Default)]
pub struct RandomNamer;

impl ResourceNamer for RandomNamer {
    fn unique_name(&self, prefix: &str, max_len: usize) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        fit(prefix, &suffix, max_len)
    }
}

/// Deterministic namer: `prefix` followed by a zero-padded counter.
#[derive(Debug, Default)]
pub struct SequentialNamer {
    next: AtomicUsize,
}

impl SequentialNamer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceNamer for SequentialNamer {
    fn unique_name(&self, prefix: &str, max_len: usize) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        fit(prefix, &format!("{:05}", n), max_len)
    }
}

/// Join prefix and suffix, trimming the suffix first and the prefix only if
/// it alone exceeds the limit.
fn fit(prefix: &str, suffix: &str, max_len: usize) -> String {
    if prefix.len() >= max_len {
        return prefix.chars().take(max_len).collect();
    }
    let room = max_len - prefix.len();
    let tail: String = suffix.chars().take(room).collect();
    format!("{}{}", prefix, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_names_respect_max_len() {
        let namer = RandomNamer;
        let name = namer.unique_name("stg", 24);
        assert_eq!(name.len(), 24);
        assert!(name.starts_with("stg"));
        assert_ne!(name, namer.unique_name("stg", 24));
    }

    #[test]
    fn test_sequential_names_are_stable() {
        let namer = SequentialNamer::new();
        assert_eq!(namer.unique_name("port", 9), "port00000");
        assert_eq!(namer.unique_name("port", 9), "port00001");
        assert_eq!(namer.unique_name("backend", 10), "backend000");
    }

    #[test]
    fn test_long_prefix_is_truncated() {
        let namer = SequentialNamer::new();
        assert_eq!(namer.unique_name("averyverylongprefix", 5), "avery");
    }
}
