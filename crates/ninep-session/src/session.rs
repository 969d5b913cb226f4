//! Sessions: the fids derived from one attach and the requests made on them.
//!
//! Messages for a session are processed in arrival order by the session's
//! intake task. Messages that need an application decision become
//! [`Request`]s handed to the consumer through a rendezvous channel: a push
//! completes only once [`Session::next`] has taken the request. Reads, writes
//! and clunks are serviced by the intake task itself.

use {
    crate::{
        conn::Conn,
        error, errstr,
        fcall::*,
        file::{self, FileHandle, FileIo},
        request::{ReqInfo, Request},
        utils::{FidMap, RefCount},
        walk::Walker,
    },
    log::{debug, warn},
    std::{
        fmt,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
    },
    tokio::sync::{mpsc, oneshot},
    tokio_util::sync::CancellationToken,
};

/// A request in transit to the consumer. `accepted` fires once it is taken.
pub(crate) struct Delivery {
    req: Request,
    accepted: oneshot::Sender<()>,
}

/// State shared by a session's intake task, its consumer and its requests.
pub struct SessionState {
    pub(crate) user: String,
    pub(crate) access: String,
    pub(crate) conn: Arc<Conn>,
    pub(crate) files: FidMap<FileHandle>,
    pub(crate) refs: RefCount,
    requests: Mutex<Option<mpsc::Sender<Delivery>>>,
    intake: Mutex<Option<mpsc::UnboundedSender<Msg>>>,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("user", &self.user)
            .field("access", &self.access)
            .field("fids", &self.files.len())
            .field("refs", &self.refs.get())
            .finish()
    }
}

/// The consumer's end of a session.
///
/// ```no_run
/// # use ninep_session::{session::Session, request::Request, errstr};
/// # async fn serve(session: &mut Session) {
/// while session.next().await {
///     match session.request() {
///         Some(Request::Stat(r)) => r.rerror(errstr::EPERM),
///         _ => {} // answered by default on the next iteration
///     }
/// }
/// # }
/// ```
pub struct Session {
    state: Arc<SessionState>,
    requests: mpsc::Receiver<Delivery>,
    req: Option<Request>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("request", &self.req)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(conn: Arc<Conn>, user: &str, access: &str) -> Session {
        // One slot plus the acceptance handshake makes each push a rendezvous.
        let (tx, rx) = mpsc::channel(1);
        let state = SessionState {
            user: user.to_owned(),
            access: access.to_owned(),
            conn,
            files: FidMap::new(),
            refs: RefCount::default(),
            requests: Mutex::new(Some(tx)),
            intake: Mutex::new(None),
        };

        Session {
            state: Arc::new(state),
            requests: rx,
            req: None,
        }
    }

    pub(crate) fn state(&self) -> Arc<SessionState> {
        self.state.clone()
    }

    pub fn user(&self) -> &str {
        &self.state.user
    }

    /// The file tree the client attached to.
    pub fn access(&self) -> &str {
        &self.state.access
    }

    /// Wait for the next request.
    ///
    /// The previous request, if still unanswered, gets its default response
    /// first. Returns false once the session has ended.
    pub async fn next(&mut self) -> bool {
        if let Some(req) = self.req.take() {
            req.default_response();
        }

        while let Some(Delivery { req, accepted }) = self.requests.recv().await {
            let _ = accepted.send(());
            if req.is_stale() {
                req.info().claim();
                continue;
            }
            self.req = Some(req);
            return true;
        }
        false
    }

    /// The request returned by the last successful [`next`](Self::next).
    pub fn request(&self) -> Option<&Request> {
        self.req.as_ref()
    }

    /// Wind down after the consumer has returned.
    ///
    /// Every request still in flight gets its default response, then every
    /// open file is closed.
    pub(crate) async fn finish(mut self) {
        if let Some(req) = self.req.take() {
            req.default_response();
        }
        self.requests.close();
        while let Some(Delivery { req, .. }) = self.requests.recv().await {
            req.default_response();
        }
        self.state.cleanup_handler().await;
    }
}

impl SessionState {
    /// Bind `fid` to this session in both fid tables.
    ///
    /// Returns false, changing nothing, if the connection already uses `fid`
    /// or the session has ended.
    pub(crate) fn register_fid(self: &Arc<Self>, fid: u32, file: FileHandle) -> bool {
        // Held across the increment so no fid can join after the last one left.
        let requests = self.lock_requests();
        if requests.is_none() {
            debug!("fid {} refused: session of {} has ended", fid, self.user);
            return false;
        }
        if !self.conn.sessions.put_if_absent(fid, self.clone()) {
            return false;
        }
        self.files.put(fid, file);
        let refs = self.refs.inc();
        debug!("fid {} joined session of {} ({} refs)", fid, self.user, refs);
        true
    }

    /// Unbind `fid` from both tables, handing back its open file.
    /// The reference is kept; see [`drop_ref`](Self::drop_ref).
    pub(crate) fn release_fid(&self, fid: u32) -> Option<Arc<dyn FileIo>> {
        self.conn.sessions.del(fid);
        self.files.del(fid).and_then(|f| f.io)
    }

    pub(crate) fn drop_ref(&self) {
        let mut requests = self.lock_requests();
        match self.refs.dec() {
            Some(0) => self.end_locked(&mut requests),
            Some(_) => {}
            None => warn!("session of {}: reference dropped below zero", self.user),
        }
    }

    /// Close the request channel and the intake. Safe to call repeatedly.
    pub(crate) fn end_session(&self) {
        let mut requests = self.lock_requests();
        self.end_locked(&mut requests);
    }

    pub(crate) fn has_ended(&self) -> bool {
        self.lock_requests().is_none()
    }

    fn lock_requests(&self) -> MutexGuard<'_, Option<mpsc::Sender<Delivery>>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn end_locked(&self, requests: &mut Option<mpsc::Sender<Delivery>>) {
        let requests = requests.take();
        let intake = self
            .intake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if requests.is_some() || intake.is_some() {
            debug!("session of {} ended", self.user);
        }
    }

    /// Close every open file and forget every fid without answering anyone.
    pub(crate) async fn cleanup_handler(&self) {
        for (fid, file) in self.files.drain() {
            if let Some(io) = file.io
                && let Err(e) = io.close().await
            {
                warn!("cleanup: close of fid {} ({}) failed: {}", fid, file.path, e);
            }
        }
    }

    /// Start the task that processes this session's messages in order.
    pub(crate) fn spawn_intake(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.intake.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let state = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                state.handle(msg).await;
            }
        });
    }

    /// Queue `msg` for the intake task. Hands it back if the session has ended.
    pub(crate) fn enqueue(&self, msg: Msg) -> Result<(), Msg> {
        let intake = self.intake.lock().unwrap_or_else(PoisonError::into_inner);
        match intake.as_ref() {
            Some(tx) => tx.send(msg).map_err(|e| e.0),
            None => Err(msg),
        }
    }

    /// Hand `req` to the consumer and wait until it has been taken.
    ///
    /// If there is no consumer any more the default response fires here.
    async fn push(&self, req: Request) {
        let tx = self.lock_requests().clone();
        let Some(tx) = tx else {
            return req.default_response();
        };

        let (accepted, taken) = oneshot::channel();
        match tx.send(Delivery { req, accepted }).await {
            // Dropped untaken only when the consumer is gone; it answers then.
            Ok(()) => {
                let _ = taken.await;
            }
            Err(mpsc::error::SendError(delivery)) => delivery.req.default_response(),
        }
    }

    pub(crate) async fn handle(self: &Arc<Self>, msg: Msg) {
        let Msg { tag, body } = msg;
        let cx = self.conn.context(tag);
        if cx.is_cancelled() {
            debug!("tag {} flushed before it was processed", tag);
            return self.conn.clear_tag(tag);
        }

        let Some(fid) = body.fid() else {
            warn!("session got a message without a fid: {:?}", body);
            return self.conn.rerror(tag, errstr::EPROTO);
        };
        let Some(file) = self.files.get(fid) else {
            if let FCall::TClunk { .. } = body {
                return self.clunk_orphan(tag, fid);
            }
            return self.conn.rerror(tag, format!("unknown fid {}", fid));
        };

        match body {
            FCall::TWalk { newfid, wnames, .. } => {
                self.handle_twalk(cx, tag, fid, newfid, file, wnames).await
            }
            FCall::TOpen { mode, .. } => self.handle_topen(cx, tag, fid, file, mode).await,
            FCall::TCreate {
                name, perm, mode, ..
            } => {
                self.handle_tcreate(cx, tag, fid, file, name, perm, mode)
                    .await
            }
            FCall::TRemove { .. } => {
                let info = ReqInfo::new(self.clone(), cx, tag, fid, file.path);
                self.push(Request::remove(info)).await
            }
            FCall::TStat { .. } => self.handle_tstat(cx, tag, fid, file).await,
            FCall::TRead { offset, count, .. } => {
                self.handle_tread(cx, tag, file, offset, count).await
            }
            FCall::TWrite { offset, data, .. } => {
                self.handle_twrite(cx, tag, file, offset, data).await
            }
            FCall::TClunk { .. } => self.handle_tclunk(tag, fid, file).await,
            FCall::TWStat { .. } => self.conn.rerror(tag, errstr::EOPNOTSUPP),
            body => {
                warn!("session cannot handle {:?}", MsgType::from(&body));
                self.conn.rerror(tag, errstr::EPROTO)
            }
        }
    }

    async fn handle_twalk(
        self: &Arc<Self>,
        cx: CancellationToken,
        tag: u16,
        fid: u32,
        newfid: u32,
        file: FileHandle,
        wnames: Vec<String>,
    ) {
        let conn = &self.conn;
        if file.is_open() {
            return conn.rerror(tag, format!("cannot walk from open fid {}", fid));
        }
        if wnames.len() > MAXWELEM {
            return conn.rerror(tag, format!("walk of {} elements exceeds {}", wnames.len(), MAXWELEM));
        }
        if newfid != fid && conn.sessions.contains(newfid) {
            return conn.rerror(tag, format!("fid {} already in use", newfid));
        }

        if wnames.is_empty() {
            // the source is not open, so the clone shares everything but the fid
            if newfid != fid && !self.register_fid(newfid, file) {
                return conn.rerror(tag, format!("fid {} already in use", newfid));
            }
            return conn.rwalk(tag, Vec::new());
        }

        let walker = Walker::new(self.clone(), tag, fid, newfid, &file.path, &wnames[..]);
        for (index, name) in wnames.into_iter().enumerate() {
            if walker.is_done() {
                break;
            }
            if cx.is_cancelled() {
                walker.fail(index, errstr::EINTR);
                break;
            }
            let path = walker.path(index).to_owned();
            let info = ReqInfo::new(self.clone(), cx.clone(), tag, fid, path);
            self.push(Request::walk(info, index, name, walker.clone()))
                .await;
        }
    }

    async fn handle_topen(
        self: &Arc<Self>,
        cx: CancellationToken,
        tag: u16,
        fid: u32,
        file: FileHandle,
        mode: u8,
    ) {
        if file.is_open() {
            return self.conn.rerror(tag, format!("fid {} already open", fid));
        }
        let info = ReqInfo::new(self.clone(), cx, tag, fid, file.path);
        self.push(Request::open(info, file::open_flag(mode))).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_tcreate(
        self: &Arc<Self>,
        cx: CancellationToken,
        tag: u16,
        fid: u32,
        file: FileHandle,
        name: String,
        perm: u32,
        mode: u8,
    ) {
        let conn = &self.conn;
        if file.is_open() {
            return conn.rerror(tag, format!("fid {} already open", fid));
        }
        let is_dir = conn
            .known_qid(&file.path)
            .is_some_and(|q| q.typ.contains(QIdType::DIR));
        if !is_dir {
            return conn.rerror(tag, errstr::ENOTDIR);
        }
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return conn.rerror(tag, errstr::EINVAL);
        }

        let info = ReqInfo::new(self.clone(), cx, tag, fid, file.path);
        let req = Request::create(info, name, file::unix_mode(perm), file::open_flag(mode));
        self.push(req).await
    }

    async fn handle_tstat(
        self: &Arc<Self>,
        cx: CancellationToken,
        tag: u16,
        fid: u32,
        file: FileHandle,
    ) {
        if !file.is_auth() {
            let info = ReqInfo::new(self.clone(), cx, tag, fid, file.path);
            return self.push(Request::stat(info)).await;
        }

        let owner = if self.user.len() <= MAX_UID_LEN {
            self.user.clone()
        } else {
            String::new()
        };
        let stat = Stat {
            qid: self.conn.qid(&file.path, QIdType::AUTH),
            mode: dm::AUTH,
            uid: owner.clone(),
            gid: owner,
            ..Default::default()
        };
        debug_assert!(stat.fits(), "auth stat record too large");
        self.conn.rstat(tag, stat);
    }

    async fn handle_tread(
        &self,
        cx: CancellationToken,
        tag: u16,
        file: FileHandle,
        offset: u64,
        count: u32,
    ) {
        let Some(io) = file.io else {
            return self
                .conn
                .rerror(tag, format!("file {} is not open for reading", file.path));
        };

        let mut buf = vec![0; count.min(self.conn.iounit()) as usize];
        let read = tokio::select! {
            _ = cx.cancelled() => None,
            read = file::read_full_at(&*io, &mut buf, offset) => Some(read),
        };

        match read {
            None => {
                debug!("read on tag {} cancelled", tag);
                self.conn.clear_tag(tag);
            }
            Some((_, Some(e))) => self.conn.rerror(tag, error::ename(&e)),
            Some((n, None)) => {
                buf.truncate(n);
                self.conn.rread(tag, buf);
            }
        }
    }

    async fn handle_twrite(
        &self,
        cx: CancellationToken,
        tag: u16,
        file: FileHandle,
        offset: u64,
        data: Data,
    ) {
        let Some(io) = file.io else {
            return self
                .conn
                .rerror(tag, format!("file {} is not opened for writing", file.path));
        };

        let written = tokio::select! {
            _ = cx.cancelled() => None,
            written = file::write_all_at(&*io, &data.0, offset) => Some(written),
        };

        match written {
            None => {
                debug!("write on tag {} cancelled", tag);
                self.conn.clear_tag(tag);
            }
            Some((0, Some(e))) => self.conn.rerror(tag, error::ename(&e)),
            Some((n, _)) => self.conn.rwrite(tag, n as u32),
        }
    }

    async fn handle_tclunk(&self, tag: u16, fid: u32, file: FileHandle) {
        self.conn.sessions.del(fid);
        let closed = match &file.io {
            Some(io) => io.close().await,
            None => Ok(()),
        };
        self.files.del(fid);

        match closed {
            Err(e) => self
                .conn
                .rerror(tag, format!("close {}: {}", file.path, error::ename(&e))),
            Ok(()) => self.conn.rclunk(tag),
        }
        self.drop_ref();
    }

    /// Clunk of a fid routed here whose descriptor cleanup already dropped.
    fn clunk_orphan(self: &Arc<Self>, tag: u16, fid: u32) {
        match self.conn.sessions.get(fid) {
            Some(owner) if Arc::ptr_eq(&owner, self) => {
                self.conn.sessions.del(fid);
                self.conn.rclunk(tag);
                self.drop_ref();
            }
            _ => self.conn.rerror(tag, format!("unknown fid {}", fid)),
        }
    }
}
