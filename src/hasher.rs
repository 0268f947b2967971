// Module provide the hashing capability required from map keys.
//
// * **[KeyHash]**, trait every key type must implement, returns 32-bit digest.
// * Integer keys hash to their own value, truncated to 32 bits.
// * Text keys use DJB2.
// * **[Hashed]**, wraps any [Hash] type and digests it with google's city hash.
// * **[Formatted]**, wraps any [Display] type and digests its text with FNV-1a.

use std::{
    borrow::Cow,
    fmt::{self, Display},
    hash::{BuildHasher, Hash, Hasher},
    ops::Deref,
    rc::Rc,
    sync::Arc,
};

const DJB2_SEED: u32 = 5381;
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Capability required from keys, compute a deterministic 32-bit digest.
///
/// Two keys that are equal must return the same digest. Digests need not be
/// stable across process runs. When a key type `K` implements [Borrow<Q>],
/// `K` and `Q` must return the same digest for the same logical key, same as
/// with [Hash].
///
/// [Borrow<Q>]: std::borrow::Borrow
pub trait KeyHash {
    fn key_hash(&self) -> u32;
}

macro_rules! impl_integer_key {
    ($($t:ty),*) => {
        $(
            impl KeyHash for $t {
                #[inline]
                fn key_hash(&self) -> u32 {
                    *self as u32
                }
            }
        )*
    };
}

impl_integer_key!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

impl KeyHash for char {
    #[inline]
    fn key_hash(&self) -> u32 {
        *self as u32
    }
}

impl KeyHash for bool {
    fn key_hash(&self) -> u32 {
        let text: &[u8] = if *self { b"true" } else { b"false" };
        fnv1a(text)
    }
}

impl KeyHash for str {
    #[inline]
    fn key_hash(&self) -> u32 {
        djb2(self.as_bytes())
    }
}

impl KeyHash for String {
    #[inline]
    fn key_hash(&self) -> u32 {
        djb2(self.as_bytes())
    }
}

impl<'a> KeyHash for Cow<'a, str> {
    #[inline]
    fn key_hash(&self) -> u32 {
        djb2(self.as_bytes())
    }
}

impl<T> KeyHash for &T
where
    T: KeyHash + ?Sized,
{
    #[inline]
    fn key_hash(&self) -> u32 {
        (**self).key_hash()
    }
}

impl<T> KeyHash for Box<T>
where
    T: KeyHash + ?Sized,
{
    #[inline]
    fn key_hash(&self) -> u32 {
        self.as_ref().key_hash()
    }
}

impl<T> KeyHash for Rc<T>
where
    T: KeyHash + ?Sized,
{
    #[inline]
    fn key_hash(&self) -> u32 {
        self.as_ref().key_hash()
    }
}

impl<T> KeyHash for Arc<T>
where
    T: KeyHash + ?Sized,
{
    #[inline]
    fn key_hash(&self) -> u32 {
        self.as_ref().key_hash()
    }
}

/// DJB2 rolling hash, ``h = h * 33 + c``, in wrapping 32-bit arithmetic.
pub fn djb2(bytes: &[u8]) -> u32 {
    bytes.iter().fold(DJB2_SEED, |h, c| {
        (h << 5).wrapping_add(h).wrapping_add(u32::from(*c))
    })
}

/// 32-bit FNV-1a hash.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hasher = Fnv1a::default();
    hasher.update(bytes);
    hasher.0
}

struct Fnv1a(u32);

impl Default for Fnv1a {
    fn default() -> Fnv1a {
        Fnv1a(FNV_OFFSET_BASIS)
    }
}

impl Fnv1a {
    fn update(&mut self, bytes: &[u8]) {
        for c in bytes.iter() {
            self.0 = (self.0 ^ u32::from(*c)).wrapping_mul(FNV_PRIME);
        }
    }
}

impl fmt::Write for Fnv1a {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.update(s.as_bytes());
        Ok(())
    }
}

/// Key wrapper, hash the canonical text representation of `T`.
///
/// Slow compared to other key kinds, and keys whose [Display] output
/// coincide always collide into the same bucket. Use this only when `T`
/// cannot implement [Hash].
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Formatted<T>(pub T);

impl<T> KeyHash for Formatted<T>
where
    T: Display,
{
    fn key_hash(&self) -> u32 {
        use std::fmt::Write;

        let mut hasher = Fnv1a::default();
        // formatting into a hasher can only fail if T's Display does.
        write!(hasher, "{}", self.0).ok();
        hasher.0
    }
}

impl<T> Deref for Formatted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: Display> Display for Formatted<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Key wrapper, hash `T` with its [Hash] implementation using
/// [DefaultHasher].
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Hashed<T>(pub T);

impl<T> KeyHash for Hashed<T>
where
    T: Hash,
{
    fn key_hash(&self) -> u32 {
        let mut hasher = DefaultHasher::new().build_hasher();
        self.0.hash(&mut hasher);
        let code: u64 = hasher.finish();
        (((code >> 32) ^ code) & 0xFFFFFFFF) as u32
    }
}

impl<T> Deref for Hashed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: Display> Display for Hashed<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Type uses google's city hash to convert [Hash]able key into ``u64``.
/// Refer [cityhash_rs] for details.
#[derive(Clone, Copy, Default)]
pub struct DefaultHasher {
    city_hash: u128,
}

impl DefaultHasher {
    pub fn new() -> DefaultHasher {
        DefaultHasher::default()
    }
}

impl BuildHasher for DefaultHasher {
    type Hasher = Self;

    #[inline]
    fn build_hasher(&self) -> Self {
        *self
    }
}

impl Hasher for DefaultHasher {
    fn finish(&self) -> u64 {
        ((self.city_hash >> 64) as u64) ^ ((self.city_hash & 0xFFFFFFFFFFFFFFFF) as u64)
    }

    // multiple writes are chained, so that every field of a compound key
    // contribute to the digest.
    fn write(&mut self, bytes: &[u8]) {
        let code = cityhash_rs::cityhash_110_128(bytes);
        self.city_hash = self.city_hash.rotate_left(23) ^ code;
    }
}

#[cfg(test)]
#[path = "hasher_test.rs"]
mod hasher_test;
