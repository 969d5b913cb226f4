//! Multi-element walk coordination.
//!
//! A Twalk with `n` names becomes `n` [`Twalk`](crate::request::Twalk)
//! requests, one per element, sharing a single [`Walker`]. The walker collects
//! the per-element outcomes and answers the client exactly once.

use {
    crate::{
        fcall::QId,
        file::FileHandle,
        session::SessionState,
        utils::join_path,
    },
    log::{debug, warn},
    std::{
        fmt,
        sync::{Arc, Mutex, PoisonError},
    },
};

#[derive(Default)]
struct Progress {
    qids: Vec<QId>,
    done: bool,
}

pub struct Walker {
    session: Arc<SessionState>,
    tag: u16,
    fid: u32,
    newfid: u32,
    /// Cumulative path after each element.
    paths: Vec<String>,
    progress: Mutex<Progress>,
}

impl fmt::Debug for Walker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Walker")
            .field("tag", &self.tag)
            .field("fid", &self.fid)
            .field("newfid", &self.newfid)
            .field("paths", &self.paths)
            .finish()
    }
}

impl Walker {
    pub(crate) fn new<S: AsRef<str>>(
        session: Arc<SessionState>,
        tag: u16,
        fid: u32,
        newfid: u32,
        base: &str,
        elems: &[S],
    ) -> Arc<Walker> {
        let paths = (1..=elems.len())
            .map(|i| join_path(base, &elems[..i]))
            .collect();

        Arc::new(Walker {
            session,
            tag,
            fid,
            newfid,
            paths,
            progress: Mutex::new(Progress::default()),
        })
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn newfid(&self) -> u32 {
        self.newfid
    }

    /// Number of path elements being walked.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// The path reached after walking element `index`.
    pub fn path(&self, index: usize) -> &str {
        &self.paths[index]
    }

    /// Whether the client has already been answered.
    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that element `index` resolved to `qid`.
    pub(crate) fn succeed(&self, index: usize, qid: QId) {
        let qids = {
            let mut progress = self.lock();
            if progress.done || index != progress.qids.len() {
                warn!(
                    "walk tag {}: out of order result for element {}",
                    self.tag, index
                );
                return;
            }
            progress.qids.push(qid);
            if progress.qids.len() < self.paths.len() {
                return;
            }
            progress.done = true;
            std::mem::take(&mut progress.qids)
        };
        self.commit(qids);
    }

    /// Record that element `index` could not be walked.
    ///
    /// A failure on the first element is an error; later failures answer
    /// with the qids walked so far and leave `newfid` unbound.
    pub(crate) fn fail(&self, index: usize, ename: &str) {
        let qids = {
            let mut progress = self.lock();
            if progress.done {
                return;
            }
            progress.done = true;
            std::mem::take(&mut progress.qids)
        };
        debug!("walk tag {} stopped at element {}: {}", self.tag, index, ename);

        let conn = &self.session.conn;
        if qids.is_empty() {
            conn.rerror(self.tag, ename);
        } else {
            conn.rwalk(self.tag, qids);
        }
    }

    fn commit(&self, qids: Vec<QId>) {
        let conn = &self.session.conn;
        let path = match self.paths.last() {
            Some(path) => path.clone(),
            None => return conn.rwalk(self.tag, qids),
        };

        if self.newfid == self.fid {
            if !self.session.files.update(self.fid, |f| f.path = path) {
                return conn.rerror(self.tag, format!("unknown fid {}", self.fid));
            }
        } else if !self
            .session
            .register_fid(self.newfid, FileHandle::new(path))
        {
            if self.session.has_ended() {
                return conn.rerror(self.tag, format!("walk from fid {}: session has ended", self.fid));
            }
            return conn.rerror(self.tag, format!("fid {} already in use", self.newfid));
        }
        conn.rwalk(self.tag, qids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conn::Conn, fcall::*, session::Session};

    fn qid(path: u64) -> QId {
        QId {
            typ: QIdType::DIR,
            version: 0,
            path,
        }
    }

    #[tokio::test]
    async fn paths_are_cumulative() {
        let (conn, _rx) = Conn::new(8192);
        let session = Session::new(conn, "glenda", "");
        let walker = Walker::new(session.state(), 1, 0, 1, "/x", &["a", "b", "c"]);

        assert_eq!(walker.len(), 3);
        assert_eq!(walker.path(0), "/x/a");
        assert_eq!(walker.path(1), "/x/a/b");
        assert_eq!(walker.path(2), "/x/a/b/c");
    }

    #[tokio::test]
    async fn commit_registers_newfid() {
        let (conn, mut rx) = Conn::new(8192);
        let session = Session::new(conn.clone(), "glenda", "");
        let state = session.state();
        assert!(state.register_fid(0, FileHandle::new("/")));

        let walker = Walker::new(state.clone(), 7, 0, 1, "/", &["usr", "glenda"]);
        walker.succeed(0, qid(1));
        assert!(rx.try_recv().is_err());
        walker.succeed(1, qid(2));

        assert_eq!(
            rx.try_recv().unwrap(),
            Msg {
                tag: 7,
                body: FCall::RWalk {
                    wqids: vec![qid(1), qid(2)]
                }
            }
        );
        assert_eq!(state.files.get(1).unwrap().path(), "/usr/glenda");
        assert!(conn.sessions.contains(1));
        assert_eq!(state.refs.get(), 2);
    }

    #[tokio::test]
    async fn in_place_walk_rebinds_path() {
        let (conn, mut rx) = Conn::new(8192);
        let session = Session::new(conn, "glenda", "");
        let state = session.state();
        assert!(state.register_fid(0, FileHandle::new("/")));

        let walker = Walker::new(state.clone(), 2, 0, 0, "/", &["tmp"]);
        walker.succeed(0, qid(9));

        assert_eq!(rx.try_recv().unwrap().body, FCall::RWalk { wqids: vec![qid(9)] });
        assert_eq!(state.files.get(0).unwrap().path(), "/tmp");
        assert_eq!(state.refs.get(), 1);
    }

    #[tokio::test]
    async fn partial_failure_answers_with_walked_prefix() {
        let (conn, mut rx) = Conn::new(8192);
        let session = Session::new(conn.clone(), "glenda", "");
        let state = session.state();
        assert!(state.register_fid(0, FileHandle::new("/")));

        let walker = Walker::new(state.clone(), 3, 0, 5, "/", &["a", "b", "c"]);
        walker.succeed(0, qid(1));
        walker.fail(1, "No such file or directory");
        walker.fail(2, "ignored");
        walker.succeed(2, qid(3));

        assert_eq!(rx.try_recv().unwrap().body, FCall::RWalk { wqids: vec![qid(1)] });
        assert!(rx.try_recv().is_err());
        assert!(!conn.sessions.contains(5));
        assert_eq!(state.refs.get(), 1);
    }

    #[tokio::test]
    async fn first_element_failure_is_an_error() {
        let (conn, mut rx) = Conn::new(8192);
        let session = Session::new(conn, "glenda", "");
        let walker = Walker::new(session.state(), 4, 0, 5, "/", &["nope"]);
        walker.fail(0, "No such file or directory");

        assert_eq!(
            rx.try_recv().unwrap().body,
            FCall::RError {
                ename: "No such file or directory".to_owned()
            }
        );
        assert!(walker.is_done());
    }
}
