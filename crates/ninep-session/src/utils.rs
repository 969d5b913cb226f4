use {
    crate::error,
    std::{
        collections::HashMap,
        sync::{
            PoisonError, RwLock,
            atomic::{AtomicUsize, Ordering},
        },
    },
};

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// A fid-keyed map safe to share between tasks.
///
/// Values are cloned out; the lock is never held across an await point.
#[derive(Debug)]
pub struct FidMap<V> {
    inner: RwLock<HashMap<u32, V>>,
}

impl<V> Default for FidMap<V> {
    fn default() -> Self {
        FidMap {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<V: Clone> FidMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fid: u32) -> Option<V> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&fid).cloned()
    }

    pub fn contains(&self, fid: u32) -> bool {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.contains_key(&fid)
    }

    pub fn put(&self, fid: u32, value: V) -> Option<V> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(fid, value)
    }

    /// Insert only if `fid` is vacant. Returns whether the value went in.
    pub fn put_if_absent(&self, fid: u32, value: V) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match map.entry(fid) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(value);
                true
            }
        }
    }

    pub fn del(&self, fid: u32) -> Option<V> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(&fid)
    }

    /// Remove the entry for `fid` if `pred` holds for it.
    pub fn del_if<F: FnOnce(&V) -> bool>(&self, fid: u32, pred: F) -> Option<V> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match map.get(&fid) {
            Some(v) if pred(v) => map.remove(&fid),
            _ => None,
        }
    }

    /// Mutate the entry for `fid` in place. Returns false if there is none.
    pub fn update<F: FnOnce(&mut V)>(&self, fid: u32, f: F) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match map.get_mut(&fid) {
            Some(v) => {
                f(v);
                true
            }
            None => false,
        }
    }

    /// Empty the map, handing back everything it held.
    pub fn drain(&self) -> Vec<(u32, V)> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.drain().collect()
    }

    pub fn len(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counts the fids referring to a session.
#[derive(Debug, Default)]
pub struct RefCount(AtomicUsize);

impl RefCount {
    /// Add a reference, returning the new count.
    pub fn inc(&self) -> usize {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a reference, returning the new count.
    ///
    /// Returns `None` without touching the counter when it is already zero,
    /// so exactly one caller ever observes the transition to `Some(0)`.
    pub fn dec(&self) -> Option<usize> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Lexically clean a slash-separated path: collapse repeated slashes,
/// drop `.` elements and resolve `..` against the preceding element.
/// `..` at the root stays at the root.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();

    for elem in path.split('/') {
        match elem {
            "" | "." => {}
            ".." => {
                if out.last().is_some_and(|last| *last != "..") {
                    out.pop();
                } else if !rooted {
                    out.push("..");
                }
            }
            elem => out.push(elem),
        }
    }

    match (rooted, out.is_empty()) {
        (true, _) => format!("/{}", out.join("/")),
        (false, true) => ".".to_owned(),
        (false, false) => out.join("/"),
    }
}

/// Join path elements onto `base` and clean the result.
pub fn join_path<S: AsRef<str>>(base: &str, elems: &[S]) -> String {
    let mut path = base.to_owned();
    for elem in elems {
        path.push('/');
        path.push_str(elem.as_ref());
    }
    clean_path(&path)
}
