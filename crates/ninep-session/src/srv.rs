//! Asynchronous 9P2000 connection serving.
//!
//! [`dispatch`] reads framed messages from a connection, answers the
//! connection-level ones (version, auth, attach, flush) itself and routes
//! every fid-bearing message to the session owning the fid. Each attach
//! starts a [`Handler::serve9p`] task consuming that session's requests.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        conn::Conn,
        errstr,
        fcall::*,
        file::FileHandle,
        serialize,
        session::Session,
        utils::Result,
    },
    async_trait::async_trait,
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{debug, error, info, warn},
    std::sync::Arc,
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::mpsc,
    },
    tokio_stream::StreamExt,
    tokio_util::{
        codec::{FramedWrite, length_delimited::LengthDelimitedCodec},
        sync::CancellationToken,
    },
};

/// Largest message size offered to clients unless configured otherwise.
pub const DEFAULT_MSIZE: u32 = 64 * 1024;

/// The application side of a 9P2000 server.
///
/// `serve9p` is called once per attach and should loop on
/// [`Session::next`] until it returns false. Requests it leaves unanswered
/// get their default response; when it returns, any open files of the
/// session are closed.
///
/// # Example
/// ```no_run
/// use ninep_session::{srv::Handler, session::Session, request::Request, QIdType};
/// use async_trait::async_trait;
///
/// struct Empty;
///
/// #[async_trait]
/// impl Handler for Empty {
///     async fn serve9p(&self, session: &mut Session) {
///         while session.next().await {
///             if let Some(Request::Stat(r)) = session.request() {
///                 r.rerror("no stat for you");
///             }
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn serve9p(&self, session: &mut Session);
}

/// Per-connection settings.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Upper bound for the negotiated message size.
    pub msize: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            msize: DEFAULT_MSIZE,
        }
    }
}

fn codec() -> tokio_util::codec::length_delimited::Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian();
    builder
}

/// Serve one connection until the client hangs up.
pub async fn dispatch<H, Reader, Writer>(
    handler: Arc<H>,
    config: Config,
    reader: Reader,
    writer: Writer,
) -> Result<()>
where
    H: Handler,
    Reader: 'static + AsyncRead + Send + std::marker::Unpin,
    Writer: 'static + AsyncWrite + Send + std::marker::Unpin,
{
    let (conn, responses) = Conn::new(config.msize);
    let stop = CancellationToken::new();
    let writer = tokio::spawn(write_responses(
        codec().new_write(writer),
        responses,
        stop.clone(),
    ));

    let result = read_loop(&handler, &config, &conn, reader).await;

    shutdown(&conn);
    stop.cancel();
    match writer.await {
        Ok(Err(e)) => error!("Failed to write responses: {:?}", e),
        Err(e) => error!("Response writer panicked: {:?}", e),
        Ok(Ok(())) => {}
    }

    result
}

async fn read_loop<H, Reader>(
    handler: &Arc<H>,
    config: &Config,
    conn: &Arc<Conn>,
    reader: Reader,
) -> Result<()>
where
    H: Handler,
    Reader: AsyncRead + std::marker::Unpin,
{
    let mut framedread = codec().new_read(reader);
    while let Some(bytes) = framedread.next().await {
        let bytes = bytes?;

        let msg = serialize::read_msg(&mut bytes.reader())?;
        info!("\t← {:?}", msg);

        dispatch_once(handler, config, conn, msg);
    }

    Ok(())
}

/// Abort everything in flight and end every session on the connection.
fn shutdown(conn: &Conn) {
    conn.cancel_all();
    for (_, session) in conn.sessions.drain() {
        session.end_session();
    }
}

fn dispatch_once<H: Handler>(handler: &Arc<H>, config: &Config, conn: &Arc<Conn>, msg: Msg) {
    let tag = msg.tag;
    if !conn.add_tag(tag) {
        warn!("tag {} reused while in flight, dropping {:?}", tag, msg.body);
        return;
    }

    match msg.body {
        FCall::TVersion { msize, version } => {
            shutdown(conn);
            let msize = msize.min(config.msize);
            conn.set_msize(msize);
            let version = match version.starts_with(P92000) {
                true => P92000,
                false => VERSION_UNKNOWN,
            };
            conn.rversion(tag, msize, version);
        }
        FCall::TAuth { afid, uname, aname } => {
            // The auth file has no consumer; anything pushed to it is
            // answered with its default.
            let session = Session::new(conn.clone(), &uname, &aname);
            let state = session.state();
            if !state.register_fid(afid, FileHandle::auth()) {
                return conn.rerror(tag, format!("fid {} already in use", afid));
            }
            state.spawn_intake();
            conn.rauth(tag, conn.qid("", QIdType::AUTH));
        }
        FCall::TAttach {
            fid, uname, aname, ..
        } => {
            let mut session = Session::new(conn.clone(), &uname, &aname);
            let state = session.state();
            if !state.register_fid(fid, FileHandle::new("/")) {
                return conn.rerror(tag, format!("fid {} already in use", fid));
            }
            state.spawn_intake();
            conn.rattach(tag, conn.qid("/", QIdType::DIR));

            let handler = handler.clone();
            tokio::spawn(async move {
                debug!("serving {} on {:?}", session.user(), session.access());
                handler.serve9p(&mut session).await;
                session.finish().await;
            });
        }
        FCall::TFlush { oldtag } => {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.flush(oldtag).await;
                conn.rflush(tag);
            });
        }
        body => route(conn, Msg { tag, body }),
    }
}

/// Hand a fid-bearing message to the session that owns the fid.
fn route(conn: &Conn, msg: Msg) {
    let tag = msg.tag;
    let Some(fid) = msg.body.fid() else {
        warn!("unexpected {:?} from client", MsgType::from(&msg.body));
        return conn.rerror(tag, errstr::EPROTO);
    };

    let routed = match conn.sessions.get(fid) {
        Some(session) => match session.enqueue(msg) {
            Ok(()) => true,
            Err(_) => {
                debug!("fid {} belongs to an ended session, dropping it", fid);
                conn.sessions.del_if(fid, |owner| Arc::ptr_eq(owner, &session));
                false
            }
        },
        None => false,
    };
    if !routed {
        conn.rerror(tag, format!("unknown fid {}", fid));
    }
}

/// Write responses in the order they were emitted.
///
/// Once `stop` fires, whatever is already queued is written and the task ends.
async fn write_responses<W>(
    mut framedwrite: FramedWrite<W, LengthDelimitedCodec>,
    mut responses: mpsc::UnboundedReceiver<Msg>,
    stop: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Send + std::marker::Unpin,
{
    loop {
        let response = tokio::select! {
            biased;
            response = responses.recv() => match response {
                Some(response) => response,
                None => break,
            },
            _ = stop.cancelled() => match responses.try_recv() {
                Ok(response) => response,
                Err(_) => break,
            },
        };

        let mut writer = bytes::BytesMut::with_capacity(4096).writer();
        if let Err(e) = serialize::write_msg(&mut writer, &response) {
            error!("Failed to serialize response for tag {}: {:?}", response.tag, e);
            continue;
        }

        framedwrite.send(writer.into_inner().freeze()).await?;
        info!("\t→ {:?}", response);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{file::testing::MemFile, request::Request};
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    struct Motd;

    #[async_trait]
    impl Handler for Motd {
        async fn serve9p(&self, session: &mut Session) {
            while session.next().await {
                match session.request() {
                    Some(Request::Walk(w)) if w.path() == "/motd" => w.rwalk(QIdType::FILE),
                    Some(Request::Open(r)) => {
                        r.ropen(Arc::new(MemFile::with(b"hello")), QIdType::FILE)
                    }
                    _ => {}
                }
            }
        }
    }

    struct Client {
        framed: Framed<DuplexStream, LengthDelimitedCodec>,
    }

    impl Client {
        async fn rpc(&mut self, tag: u16, body: FCall) -> FCall {
            let mut writer = bytes::BytesMut::new().writer();
            serialize::write_msg(&mut writer, &Msg { tag, body }).unwrap();
            self.framed.send(writer.into_inner().freeze()).await.unwrap();

            let bytes = self.framed.next().await.unwrap().unwrap();
            let msg = serialize::read_msg(&mut bytes.reader()).unwrap();
            assert_eq!(msg.tag, tag);
            msg.body
        }
    }

    fn serve() -> (Client, tokio::task::JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let config = Config { msize: 8192 };
        let server = tokio::spawn(dispatch(Arc::new(Motd), config, reader, writer));
        let client = Client {
            framed: codec().new_framed(client),
        };
        (client, server)
    }

    #[tokio::test]
    async fn serves_a_session_end_to_end() {
        let (mut c, server) = serve();

        let version = FCall::TVersion {
            msize: 1 << 20,
            version: "9P2000".to_owned(),
        };
        assert_eq!(
            c.rpc(NOTAG, version).await,
            FCall::RVersion {
                msize: 8192,
                version: P92000.to_owned()
            }
        );

        let attach = FCall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: String::new(),
        };
        assert!(matches!(c.rpc(1, attach).await, FCall::RAttach { qid } if qid.typ == QIdType::DIR));

        let walk = FCall::TWalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["motd".to_owned()],
        };
        match c.rpc(2, walk).await {
            FCall::RWalk { wqids } => assert_eq!(wqids.len(), 1),
            body => panic!("unexpected {:?}", body),
        }

        let open = FCall::TOpen { fid: 1, mode: om::READ };
        match c.rpc(3, open).await {
            FCall::ROpen { iounit, .. } => assert_eq!(iounit, 8192 - IOHDRSZ),
            body => panic!("unexpected {:?}", body),
        }

        let read = FCall::TRead {
            fid: 1,
            offset: 0,
            count: 100,
        };
        assert_eq!(
            c.rpc(4, read).await,
            FCall::RRead {
                data: Data(b"hello".to_vec())
            }
        );

        assert_eq!(c.rpc(5, FCall::TClunk { fid: 1 }).await, FCall::RClunk);

        let walk = FCall::TWalk {
            fid: 0,
            newfid: 2,
            wnames: vec!["nope".to_owned()],
        };
        assert_eq!(
            c.rpc(6, walk).await,
            FCall::RError {
                ename: errstr::ENOENT.to_owned()
            }
        );

        assert_eq!(
            c.rpc(7, FCall::TStat { fid: 42 }).await,
            FCall::RError {
                ename: "unknown fid 42".to_owned()
            }
        );

        assert_eq!(c.rpc(8, FCall::TClunk { fid: 0 }).await, FCall::RClunk);

        drop(c);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_version_and_auth() {
        let (mut c, server) = serve();

        let version = FCall::TVersion {
            msize: 4096,
            version: "9P3000".to_owned(),
        };
        assert_eq!(
            c.rpc(NOTAG, version).await,
            FCall::RVersion {
                msize: 4096,
                version: VERSION_UNKNOWN.to_owned()
            }
        );

        let auth = FCall::TAuth {
            afid: 9,
            uname: "glenda".to_owned(),
            aname: String::new(),
        };
        assert!(matches!(c.rpc(1, auth).await, FCall::RAuth { aqid } if aqid.typ == QIdType::AUTH));

        match c.rpc(2, FCall::TStat { fid: 9 }).await {
            FCall::RStat { stat } => assert_eq!(stat.mode, dm::AUTH),
            body => panic!("unexpected {:?}", body),
        }

        let attach = FCall::TAttach {
            fid: 9,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: String::new(),
        };
        assert_eq!(
            c.rpc(3, attach).await,
            FCall::RError {
                ename: "fid 9 already in use".to_owned()
            }
        );

        assert_eq!(c.rpc(4, FCall::TClunk { fid: 9 }).await, FCall::RClunk);

        drop(c);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn route_forgets_fids_of_ended_sessions() {
        let (conn, mut rx) = Conn::new(8192);
        let session = Session::new(conn.clone(), "glenda", "");
        let state = session.state();
        assert!(state.register_fid(5, FileHandle::new("/")));
        state.spawn_intake();
        state.end_session();

        assert!(conn.add_tag(1));
        route(&conn, Msg { tag: 1, body: FCall::TClunk { fid: 5 } });
        assert_eq!(
            rx.recv().await.unwrap().body,
            FCall::RError {
                ename: "unknown fid 5".to_owned()
            }
        );
        assert!(!conn.sessions.contains(5));
    }
}
