//! Requests delivered to the application by [`Session::next`](crate::session::Session::next).
//!
//! Every variant derefs to [`ReqInfo`], which carries the metadata common to
//! all requests. A request is answered at most once; later answers are logged
//! and dropped. A request the application leaves unanswered receives its
//! default response when the application asks for the next one.

use {
    crate::{
        conn::Conn,
        errstr,
        fcall::*,
        file::{FileHandle, FileIo},
        session::SessionState,
        utils::join_path,
        walk::Walker,
    },
    log::{debug, warn},
    nix::{fcntl::OFlag, libc},
    std::{
        fmt,
        ops::Deref,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
    },
    tokio_util::sync::CancellationToken,
};

/// Metadata shared by every request.
pub struct ReqInfo {
    pub(crate) session: Arc<SessionState>,
    cx: CancellationToken,
    path: String,
    tag: u16,
    fid: u32,
    handled: AtomicBool,
}

impl fmt::Debug for ReqInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReqInfo")
            .field("tag", &self.tag)
            .field("fid", &self.fid)
            .field("path", &self.path)
            .field("handled", &self.handled())
            .finish()
    }
}

impl ReqInfo {
    pub(crate) fn new(
        session: Arc<SessionState>,
        cx: CancellationToken,
        tag: u16,
        fid: u32,
        path: String,
    ) -> Self {
        ReqInfo {
            session,
            cx,
            path,
            tag,
            fid,
            handled: AtomicBool::new(false),
        }
    }

    /// Absolute, cleaned path the request refers to.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tag(&self) -> u16 {
        self.tag
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn user(&self) -> &str {
        &self.session.user
    }

    pub fn access(&self) -> &str {
        &self.session.access
    }

    /// Cancelled when the client flushes this request or the connection ends.
    pub fn context(&self) -> &CancellationToken {
        &self.cx
    }

    pub fn handled(&self) -> bool {
        self.handled.load(Ordering::Acquire)
    }

    /// The connection the request arrived on.
    pub fn conn(&self) -> &Arc<Conn> {
        &self.session.conn
    }

    /// The connection's QID for this request's path.
    pub fn qid(&self, typ: QIdType) -> QId {
        self.session.conn.qid(&self.path, typ)
    }

    /// Fail the request with `ename`.
    pub fn rerror<E: fmt::Display>(&self, ename: E) {
        if self.claim() {
            self.session.conn.rerror(self.tag, ename);
        }
    }

    /// Take the right to answer. True for exactly one caller.
    pub(crate) fn claim(&self) -> bool {
        let first = !self.handled.swap(true, Ordering::AcqRel);
        if !first {
            warn!("tag {} answered more than once", self.tag);
        }
        first
    }

    fn close_later(&self, file: Arc<dyn FileIo>) {
        let tag = self.tag;
        tokio::spawn(async move {
            if let Err(e) = file.close().await {
                warn!("tag {}: close of rejected file failed: {}", tag, e);
            }
        });
    }
}

/// One element of a walk.
pub struct Twalk {
    info: ReqInfo,
    index: usize,
    name: String,
    walker: Arc<Walker>,
}

impl Deref for Twalk {
    type Target = ReqInfo;

    fn deref(&self) -> &ReqInfo {
        &self.info
    }
}

impl Twalk {
    pub(crate) fn new(info: ReqInfo, index: usize, name: String, walker: Arc<Walker>) -> Self {
        Twalk {
            info,
            index,
            name,
            walker,
        }
    }

    /// Position of this element in the walk.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The element being walked to.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn walker(&self) -> &Walker {
        &self.walker
    }

    /// The element exists and has type `typ`.
    pub fn rwalk(&self, typ: QIdType) {
        if self.claim() {
            let qid = self.qid(typ);
            self.walker.succeed(self.index, qid);
        }
    }

    pub fn rerror<E: fmt::Display>(&self, ename: E) {
        if self.claim() {
            self.walker.fail(self.index, &ename.to_string());
        }
    }
}

pub struct Topen {
    info: ReqInfo,
    flag: OFlag,
}

impl Deref for Topen {
    type Target = ReqInfo;

    fn deref(&self) -> &ReqInfo {
        &self.info
    }
}

impl Topen {
    pub fn flag(&self) -> OFlag {
        self.flag
    }

    /// Accept the open, binding `file` to the fid.
    pub fn ropen(&self, file: Arc<dyn FileIo>, typ: QIdType) {
        if !self.claim() {
            return self.close_later(file);
        }
        let conn = &self.session.conn;
        match install(&self.session, self.fid, None, file.clone()) {
            Ok(()) => conn.ropen(self.tag, self.qid(typ)),
            Err(ename) => {
                self.close_later(file);
                conn.rerror(self.tag, ename);
            }
        }
    }
}

pub struct Tcreate {
    info: ReqInfo,
    name: String,
    perm: u32,
    flag: OFlag,
}

impl Deref for Tcreate {
    type Target = ReqInfo;

    fn deref(&self) -> &ReqInfo {
        &self.info
    }
}

impl Tcreate {
    /// Name of the file to create inside [`path`](ReqInfo::path).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unix mode of the new file, type bits included.
    pub fn perm(&self) -> u32 {
        self.perm
    }

    pub fn is_dir(&self) -> bool {
        self.perm & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    pub fn flag(&self) -> OFlag {
        self.flag
    }

    /// Path of the file being created.
    pub fn new_path(&self) -> String {
        join_path(self.path(), &[&self.name])
    }

    /// Accept the create. The fid now refers to the new file, opened as `file`.
    pub fn rcreate(&self, file: Arc<dyn FileIo>, typ: QIdType) {
        if !self.claim() {
            return self.close_later(file);
        }
        let conn = &self.session.conn;
        let path = self.new_path();
        match install(&self.session, self.fid, Some(path.clone()), file.clone()) {
            Ok(()) => conn.rcreate(self.tag, conn.qid(&path, typ)),
            Err(ename) => {
                self.close_later(file);
                conn.rerror(self.tag, ename);
            }
        }
    }
}

/// Bind an open file to `fid`, optionally moving the fid to `path`.
fn install(
    session: &SessionState,
    fid: u32,
    path: Option<String>,
    file: Arc<dyn FileIo>,
) -> Result<(), String> {
    let mut open = false;
    let found = session.files.update(fid, |f: &mut FileHandle| {
        if f.io.is_some() {
            open = true;
            return;
        }
        if let Some(path) = path {
            f.path = path;
        }
        f.io = Some(file);
    });
    match (found, open) {
        (false, _) => Err(format!("unknown fid {}", fid)),
        (true, true) => Err(format!("fid {} already open", fid)),
        (true, false) => Ok(()),
    }
}

/// Removing a file always releases its fid, whether or not it succeeds.
pub struct Tremove {
    info: ReqInfo,
}

impl Deref for Tremove {
    type Target = ReqInfo;

    fn deref(&self) -> &ReqInfo {
        &self.info
    }
}

impl Tremove {
    pub fn rremove(&self) {
        if self.claim() {
            self.release(None);
        }
    }

    pub fn rerror<E: fmt::Display>(&self, ename: E) {
        if self.claim() {
            self.release(Some(ename.to_string()));
        }
    }

    fn release(&self, ename: Option<String>) {
        let session = &self.session;
        if let Some(file) = session.release_fid(self.fid) {
            self.close_later(file);
        }
        match ename {
            Some(ename) => session.conn.rerror(self.tag, ename),
            None => {
                session.conn.forget_qid(&self.path);
                session.conn.rremove(self.tag);
            }
        }
        session.drop_ref();
    }
}

pub struct Tstat {
    info: ReqInfo,
}

impl Deref for Tstat {
    type Target = ReqInfo;

    fn deref(&self) -> &ReqInfo {
        &self.info
    }
}

impl Tstat {
    pub fn rstat(&self, stat: Stat) {
        if self.claim() {
            self.session.conn.rstat(self.tag, stat);
        }
    }
}

/// A request awaiting an application decision.
pub enum Request {
    Walk(Twalk),
    Open(Topen),
    Create(Tcreate),
    Remove(Tremove),
    Stat(Tstat),
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Request::Walk(r) => write!(f, "Twalk({} {:?}, {:?})", r.index, r.name, r.info),
            Request::Open(r) => write!(f, "Topen({:?}, {:?})", r.flag, r.info),
            Request::Create(r) => write!(f, "Tcreate({:?} {:o}, {:?})", r.name, r.perm, r.info),
            Request::Remove(r) => write!(f, "Tremove({:?})", r.info),
            Request::Stat(r) => write!(f, "Tstat({:?})", r.info),
        }
    }
}

impl Request {
    pub(crate) fn walk(info: ReqInfo, index: usize, name: String, walker: Arc<Walker>) -> Self {
        Request::Walk(Twalk::new(info, index, name, walker))
    }

    pub(crate) fn open(info: ReqInfo, flag: OFlag) -> Self {
        Request::Open(Topen { info, flag })
    }

    pub(crate) fn create(info: ReqInfo, name: String, perm: u32, flag: OFlag) -> Self {
        Request::Create(Tcreate {
            info,
            name,
            perm,
            flag,
        })
    }

    pub(crate) fn remove(info: ReqInfo) -> Self {
        Request::Remove(Tremove { info })
    }

    pub(crate) fn stat(info: ReqInfo) -> Self {
        Request::Stat(Tstat { info })
    }

    pub fn info(&self) -> &ReqInfo {
        match self {
            Request::Walk(r) => &r.info,
            Request::Open(r) => &r.info,
            Request::Create(r) => &r.info,
            Request::Remove(r) => &r.info,
            Request::Stat(r) => &r.info,
        }
    }

    pub fn path(&self) -> &str {
        self.info().path()
    }

    /// Fail the request, with the side effects its variant requires.
    pub fn rerror<E: fmt::Display>(&self, ename: E) {
        match self {
            Request::Walk(r) => r.rerror(ename),
            Request::Remove(r) => r.rerror(ename),
            r => r.info().rerror(ename),
        }
    }

    /// Answer on the application's behalf if it did not.
    pub(crate) fn default_response(&self) {
        if self.info().handled() {
            return;
        }
        debug!("default response for {:?}", self);
        match self {
            Request::Walk(r) => r.rerror(errstr::ENOENT),
            r => r.rerror(errstr::EACCES),
        }
    }

    /// A walk element whose walk has already been answered needs no decision.
    pub(crate) fn is_stale(&self) -> bool {
        match self {
            Request::Walk(r) => r.walker.is_done(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{file::testing::MemFile, session::Session};

    fn setup() -> (
        Arc<Conn>,
        tokio::sync::mpsc::UnboundedReceiver<Msg>,
        Arc<SessionState>,
        Session,
    ) {
        let (conn, rx) = Conn::new(8192);
        let session = Session::new(conn.clone(), "glenda", "main");
        let state = session.state();
        assert!(state.register_fid(0, FileHandle::new("/")));
        (conn, rx, state, session)
    }

    fn info(state: &Arc<SessionState>, tag: u16, fid: u32, path: &str) -> ReqInfo {
        ReqInfo::new(state.clone(), CancellationToken::new(), tag, fid, path.to_owned())
    }

    #[tokio::test]
    async fn answers_are_idempotent() {
        let (_conn, mut rx, state, _session) = setup();
        let req = Request::stat(info(&state, 3, 0, "/"));

        req.rerror("first");
        req.rerror("second");
        req.default_response();

        assert_eq!(
            rx.try_recv().unwrap().body,
            FCall::RError {
                ename: "first".to_owned()
            }
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(req.info().user(), "glenda");
        assert_eq!(req.info().access(), "main");
    }

    #[tokio::test]
    async fn ropen_installs_handle() {
        let (conn, mut rx, state, _session) = setup();
        let req = Topen {
            info: info(&state, 1, 0, "/"),
            flag: OFlag::O_RDONLY,
        };
        req.ropen(Arc::new(MemFile::default()), QIdType::DIR);

        match rx.try_recv().unwrap().body {
            FCall::ROpen { qid, iounit } => {
                assert_eq!(qid.typ, QIdType::DIR);
                assert_eq!(iounit, conn.iounit());
            }
            body => panic!("unexpected {:?}", body),
        }
        assert!(state.files.get(0).unwrap().is_open());
    }

    #[tokio::test]
    async fn rcreate_moves_fid_to_new_file() {
        let (_conn, mut rx, state, _session) = setup();
        let req = Tcreate {
            info: info(&state, 1, 0, "/"),
            name: "notes".to_owned(),
            perm: crate::file::unix_mode(0o644),
            flag: OFlag::O_RDWR,
        };
        assert!(!req.is_dir());
        req.rcreate(Arc::new(MemFile::default()), QIdType::FILE);

        assert!(matches!(rx.try_recv().unwrap().body, FCall::RCreate { .. }));
        let file = state.files.get(0).unwrap();
        assert_eq!(file.path(), "/notes");
        assert!(file.is_open());
    }

    #[tokio::test]
    async fn remove_failure_still_releases_fid() {
        let (conn, mut rx, state, _session) = setup();
        assert!(state.register_fid(1, FileHandle::new("/tmp")));
        assert_eq!(state.refs.get(), 2);

        let req = Request::remove(info(&state, 9, 1, "/tmp"));
        req.default_response();

        assert_eq!(
            rx.try_recv().unwrap().body,
            FCall::RError {
                ename: errstr::EACCES.to_owned()
            }
        );
        assert!(!conn.sessions.contains(1));
        assert!(state.files.get(1).is_none());
        assert_eq!(state.refs.get(), 1);
    }
}
