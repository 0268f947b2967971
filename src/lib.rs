//! Package implement a concurrent hash map whose buckets are lock-free
//! linked chains.
//!
//! Every bucket of the table is an atomic pointer to the head of a singly
//! linked chain of entries. Readers walk the chain without taking any lock,
//! writers mutate it with compare-and-swap and retry when they lose a race.
//! Memory unlinked from the map is reclaimed using epochs, so that an entry
//! removed by one thread is never freed while another thread can still be
//! traversing it.
//!
//! Each thread is expected to work on its own [Map] handle, created by
//! cloning an existing handle. All handles share the same underlying table.
//!
//! ```
//! use cchain::Map;
//!
//! let mut map: Map<String, u64> = Map::new();
//! map.put("a".to_string(), 123);
//! map.put("b".to_string(), 234);
//! assert_eq!(map.get("a"), Some(123));
//! assert!(map.delete("a"));
//! assert_eq!(map.size(), 1);
//! ```
//!
//! **Keys**
//!
//! Keys must implement [KeyHash], which this package implements for all
//! integer types and for text types. Other key types can either be wrapped
//! in [Hashed], to use their [std::hash::Hash] implementation, or in
//! [Formatted], to hash their [std::fmt::Display] text. The latter is slow and
//! piles keys whose text representation coincide into the same bucket,
//! prefer [Hashed].

use std::{error, fmt, result};

/// Short form to compose Error values, prefixed with the source location.
///
/// ```ignore
/// use crate::Error;
/// err_at!(InvalidInput, msg: "bad capacity {}", capacity);
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err($crate::Error::$v(prefix, format!($($arg),+)))
    }};
}

mod entry;
mod gc;
mod hasher;
mod map;

pub use hasher::{djb2, fnv1a, DefaultHasher, Formatted, Hashed, KeyHash};
pub use map::{Map, Stats, DEFAULT_CAPACITY, DEFAULT_LOAD_FACTOR};

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location, and a message.
#[derive(Clone, PartialEq)]
pub enum Error {
    InvalidInput(String, String),
    Fatal(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            InvalidInput(p, msg) => write!(f, "{} InvalidInput: {}", p, msg),
            Fatal(p, msg) => write!(f, "{} Fatal: {}", p, msg),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}
