//! Per-connection state shared by every session multiplexed on it.
//!
//! A [`Conn`] owns the outgoing response queue, the set of tags still
//! awaiting an answer, the QID pool and the connection-wide fid → session
//! table.

use {
    crate::{
        fcall::*,
        session::SessionState,
        utils::FidMap,
    },
    log::{debug, warn},
    std::{
        collections::{HashMap, hash_map::Entry},
        fmt,
        sync::{
            Arc, Mutex, PoisonError,
            atomic::{AtomicU32, AtomicU64, Ordering},
        },
    },
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
};

/// Bookkeeping for one outstanding tag.
#[derive(Clone)]
struct InFlight {
    /// Cancelled by Tflush or shutdown; handed to requests as their context.
    cancel: CancellationToken,
    /// Cancelled once the tag has been released.
    done: CancellationToken,
}

/// Assigns stable QIDs to paths for the lifetime of a connection.
#[derive(Default)]
struct QidPool {
    paths: Mutex<HashMap<String, QId>>,
    next: AtomicU64,
}

impl QidPool {
    /// A path seen again with a different type names a new file and gets
    /// a new QID.
    fn get(&self, path: &str, typ: QIdType) -> QId {
        let fresh = || QId {
            typ,
            version: 0,
            path: self.next.fetch_add(1, Ordering::Relaxed),
        };
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        match paths.entry(path.to_owned()) {
            Entry::Occupied(mut e) => {
                if e.get().typ != typ {
                    e.insert(fresh());
                }
                *e.get()
            }
            Entry::Vacant(e) => *e.insert(fresh()),
        }
    }

    fn peek(&self, path: &str) -> Option<QId> {
        let paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        paths.get(path).copied()
    }

    fn forget(&self, path: &str) {
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        paths.remove(path);
    }
}

pub struct Conn {
    responses: mpsc::UnboundedSender<Msg>,
    tags: Mutex<HashMap<u16, InFlight>>,
    qids: QidPool,
    msize: AtomicU32,
    /// Which session each fid on this connection belongs to.
    pub(crate) sessions: FidMap<Arc<SessionState>>,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Conn")
            .field("msize", &self.msize())
            .field("fids", &self.sessions.len())
            .finish()
    }
}

impl Conn {
    /// Create a connection whose responses are delivered, in emission
    /// order, on the returned receiver.
    pub fn new(msize: u32) -> (Arc<Conn>, mpsc::UnboundedReceiver<Msg>) {
        let (responses, rx) = mpsc::unbounded_channel();
        let conn = Conn {
            responses,
            tags: Mutex::new(HashMap::new()),
            qids: QidPool::default(),
            msize: AtomicU32::new(msize),
            sessions: FidMap::new(),
        };
        (Arc::new(conn), rx)
    }

    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::Acquire)
    }

    pub(crate) fn set_msize(&self, msize: u32) {
        self.msize.store(msize, Ordering::Release);
    }

    /// Largest payload that fits a single Rread/Twrite.
    pub fn iounit(&self) -> u32 {
        self.msize().saturating_sub(IOHDRSZ)
    }

    /// Start tracking `tag`. Returns false if it is already outstanding.
    pub(crate) fn add_tag(&self, tag: u16) -> bool {
        let mut tags = self.tags.lock().unwrap_or_else(PoisonError::into_inner);
        match tags.entry(tag) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(InFlight {
                    cancel: CancellationToken::new(),
                    done: CancellationToken::new(),
                });
                true
            }
        }
    }

    /// The cancellation context of an outstanding tag.
    ///
    /// Untracked tags get a fresh, never-cancelled token.
    pub fn context(&self, tag: u16) -> CancellationToken {
        let tags = self.tags.lock().unwrap_or_else(PoisonError::into_inner);
        tags.get(&tag)
            .map(|t| t.cancel.clone())
            .unwrap_or_default()
    }

    /// Mark `tag` as answered so the client may reuse it.
    pub fn clear_tag(&self, tag: u16) {
        let removed = {
            let mut tags = self.tags.lock().unwrap_or_else(PoisonError::into_inner);
            tags.remove(&tag)
        };
        if let Some(t) = removed {
            t.done.cancel();
        }
    }

    /// Cancel `oldtag` and wait until whoever holds it has released it.
    pub(crate) async fn flush(&self, oldtag: u16) {
        let inflight = {
            let tags = self.tags.lock().unwrap_or_else(PoisonError::into_inner);
            tags.get(&oldtag).cloned()
        };
        if let Some(t) = inflight {
            t.cancel.cancel();
            t.done.cancelled().await;
        }
    }

    /// Cancel every outstanding tag.
    pub(crate) fn cancel_all(&self) {
        let tags = self.tags.lock().unwrap_or_else(PoisonError::into_inner);
        for t in tags.values() {
            t.cancel.cancel();
        }
    }

    /// The QID for `path` as a file of type `typ`.
    pub fn qid(&self, path: &str, typ: QIdType) -> QId {
        self.qids.get(path, typ)
    }

    /// The QID last handed out for `path`, if any.
    pub fn known_qid(&self, path: &str) -> Option<QId> {
        self.qids.peek(path)
    }

    pub(crate) fn forget_qid(&self, path: &str) {
        self.qids.forget(path);
    }

    fn respond(&self, tag: u16, body: FCall) {
        if self.responses.send(Msg { tag, body }).is_err() {
            debug!("connection closed, dropping response to tag {}", tag);
        }
        self.clear_tag(tag);
    }

    pub fn rerror<E: fmt::Display>(&self, tag: u16, ename: E) {
        self.respond(
            tag,
            FCall::RError {
                ename: ename.to_string(),
            },
        );
    }

    pub fn rversion(&self, tag: u16, msize: u32, version: &str) {
        self.respond(
            tag,
            FCall::RVersion {
                msize,
                version: version.to_owned(),
            },
        );
    }

    pub fn rauth(&self, tag: u16, aqid: QId) {
        self.respond(tag, FCall::RAuth { aqid });
    }

    pub fn rattach(&self, tag: u16, qid: QId) {
        self.respond(tag, FCall::RAttach { qid });
    }

    pub fn rflush(&self, tag: u16) {
        self.respond(tag, FCall::RFlush);
    }

    pub fn rwalk(&self, tag: u16, wqids: Vec<QId>) {
        self.respond(tag, FCall::RWalk { wqids });
    }

    pub fn ropen(&self, tag: u16, qid: QId) {
        let iounit = self.iounit();
        self.respond(tag, FCall::ROpen { qid, iounit });
    }

    pub fn rcreate(&self, tag: u16, qid: QId) {
        let iounit = self.iounit();
        self.respond(tag, FCall::RCreate { qid, iounit });
    }

    pub fn rread(&self, tag: u16, data: Vec<u8>) {
        self.respond(tag, FCall::RRead { data: Data(data) });
    }

    pub fn rwrite(&self, tag: u16, count: u32) {
        self.respond(tag, FCall::RWrite { count });
    }

    pub fn rclunk(&self, tag: u16) {
        self.respond(tag, FCall::RClunk);
    }

    pub fn rremove(&self, tag: u16) {
        self.respond(tag, FCall::RRemove);
    }

    pub fn rstat(&self, tag: u16, stat: Stat) {
        if !stat.fits() {
            warn!("stat for tag {} exceeds MAX_STAT_LEN", tag);
            return self.rerror(tag, crate::errstr::EINVAL);
        }
        self.respond(tag, FCall::RStat { stat });
    }
}
