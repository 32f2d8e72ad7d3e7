//! A thread-safe hashmap guarded by a single reader-writer lock.
//!
//! # Overview
//! `tsmap` provides [`ConcurrentMap`], a generic key-value container that can be
//! shared between threads without callers managing their own locking.
//! Lookups take the lock in shared mode and run in parallel, mutations take it
//! exclusively, and batch operations apply atomically with respect to readers.
//!
//! # Features
//! - Thread-safe `get`, `set`, `pop`, `delete` and batch `delete_multiple`
//! - Whole-map `for_each`, `values` snapshot and `flush`
//! - Futex-based [`RwLock`] that prefers writers over new readers
//! - No poisoning, the lock is released normally on panic
//!
//! # Examples
//! ```
//! use tsmap::ConcurrentMap;
//!
//! let map = ConcurrentMap::<String, String>::new();
//!
//! // Basic operations
//! map.set("one".into(), "data1".into());
//! map.set("two".into(), "data2".into());
//! assert_eq!(map.get("one").as_deref(), Some("data1"));
//!
//! // Atomic read-and-remove
//! assert_eq!(map.pop("two").as_deref(), Some("data2"));
//! assert_eq!(map.get("two"), None);
//!
//! // Remove everything
//! map.flush();
//! assert!(map.is_empty());
//! ```
mod rwlock;
#[doc = include_str!("../README.md")]
mod tsmap;

pub use rwlock::*;
pub use tsmap::*;
