use {
    async_trait::async_trait,
    clap::Parser,
    log::{debug, info},
    ninep_session::{
        request::{Request, Tcreate, Topen, Tremove, Tstat, Twalk},
        session::Session,
        srv::{Config, DEFAULT_MSIZE, Handler, dispatch},
        *,
    },
    nix::{fcntl::OFlag, sys::stat::Mode},
    std::{os::unix::fs::PermissionsExt, path::PathBuf, sync::Arc},
    tokio::fs,
};

mod utils;
use crate::utils::*;

// Opens that can change file contents.
fn writes(flag: OFlag) -> bool {
    flag.intersects(OFlag::O_WRONLY | OFlag::O_RDWR | OFlag::O_TRUNC)
}

struct Export {
    root: PathBuf,
    read_only: bool,
    max_depth: usize,
}

impl Export {
    /// Paths arrive cleaned and rooted, so `..` cannot climb above `root`.
    fn realpath(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn check_writable(&self) -> Result<()> {
        match self.read_only {
            true => res!(errno::EROFS),
            false => Ok(()),
        }
    }

    async fn walk(&self, r: &Twalk) -> Result<()> {
        // Mounting the export inside itself would otherwise recurse forever.
        let depth = r.path().split('/').filter(|e| !e.is_empty()).count();
        if depth > self.max_depth {
            return res!(errno::ELOOP);
        }

        let attr = fs::symlink_metadata(self.realpath(r.path())).await?;
        r.rwalk(qid_type(&attr));
        Ok(())
    }

    async fn open(&self, r: &Topen) -> Result<()> {
        let flag = r.flag();
        if writes(flag) {
            self.check_writable()?;
        }

        let realpath = self.realpath(r.path());
        let attr = fs::symlink_metadata(&realpath).await?;
        if attr.is_dir() {
            if writes(flag) {
                return res!(errno::EISDIR);
            }
            let dir = DirFile::new(r.conn().clone(), r.path(), realpath);
            r.ropen(Arc::new(dir), QIdType::DIR);
        } else {
            let fd = nix::fcntl::open(&realpath, flag, Mode::empty())?;
            let file = LocalFile::new(fs::File::from_std(fd.into()));
            r.ropen(Arc::new(file), qid_type(&attr));
        }
        Ok(())
    }

    async fn create(&self, r: &Tcreate) -> Result<()> {
        self.check_writable()?;

        let path = r.new_path();
        let realpath = self.realpath(&path);
        let perm = r.perm() & 0o777;
        if r.is_dir() {
            fs::create_dir(&realpath).await?;
            fs::set_permissions(&realpath, PermissionsExt::from_mode(perm)).await?;
            let dir = DirFile::new(r.conn().clone(), &path, realpath);
            r.rcreate(Arc::new(dir), QIdType::DIR);
        } else {
            let flag = r.flag() | OFlag::O_CREAT | OFlag::O_EXCL;
            let fd = nix::fcntl::open(&realpath, flag, Mode::from_bits_truncate(perm))?;
            let file = LocalFile::new(fs::File::from_std(fd.into()));
            r.rcreate(Arc::new(file), QIdType::FILE);
        }
        Ok(())
    }

    async fn remove(&self, r: &Tremove) -> Result<()> {
        self.check_writable()?;
        if r.path() == "/" {
            return res!(errno::EACCES);
        }

        let realpath = self.realpath(r.path());
        match fs::symlink_metadata(&realpath).await? {
            ref attr if attr.is_dir() => fs::remove_dir(&realpath).await?,
            _ => fs::remove_file(&realpath).await?,
        };
        r.rremove();
        Ok(())
    }

    async fn stat(&self, r: &Tstat) -> Result<()> {
        let attr = fs::symlink_metadata(self.realpath(r.path())).await?;
        let qid = r.qid(qid_type(&attr));
        r.rstat(stat_from_attr(&attr, base_name(r.path()), qid));
        Ok(())
    }
}

#[async_trait]
impl Handler for Export {
    async fn serve9p(&self, session: &mut Session) {
        info!("{} attached to {:?}", session.user(), session.access());

        while session.next().await {
            let Some(req) = session.request() else {
                continue;
            };
            let result = match req {
                Request::Walk(r) => self.walk(r).await,
                Request::Open(r) => self.open(r).await,
                Request::Create(r) => self.create(r).await,
                Request::Remove(r) => self.remove(r).await,
                Request::Stat(r) => self.stat(r).await,
            };
            if let Err(e) = result {
                debug!("{:?}: {}", req, e);
                req.rerror(errstr::from_errno(e.errno()));
            }
        }

        info!("{} detached", session.user());
    }
}

#[derive(Debug, clap::Parser)]
/// Export a directory over 9P2000 on stdin and stdout
struct Cli {
    /// Directory to export
    exportdir: PathBuf,

    /// Largest message size to negotiate
    #[arg(long, default_value_t = DEFAULT_MSIZE)]
    msize: u32,

    /// Refuse opens for writing, creates and removes
    #[arg(long)]
    read_only: bool,

    /// Maximum directory depth to traverse
    #[arg(long, default_value_t = 200)]
    max_depth: usize,
}

async fn p9export_main(
    Cli {
        exportdir,
        msize,
        read_only,
        max_depth,
    }: Cli,
) -> Result<i32> {
    if !fs::metadata(&exportdir).await?.is_dir() {
        return res!(io_err!(Other, "export root must be a directory"));
    }
    let root = fs::canonicalize(&exportdir).await?;

    info!("exporting {:?} (msize {}, read-only {})", root, msize, read_only);
    let export = Export {
        root,
        read_only,
        max_depth,
    };
    dispatch(
        Arc::new(export),
        Config { msize },
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await
    .and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = p9export_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::buf::{Buf, BufMut};
    use futures::sink::SinkExt;
    use ninep_session::serialize::{self, Decodable};
    use tokio::io::DuplexStream;
    use tokio_stream::StreamExt;
    use tokio_util::codec::{Framed, length_delimited::LengthDelimitedCodec};

    struct Client {
        framed: Framed<DuplexStream, LengthDelimitedCodec>,
        tag: u16,
    }

    impl Client {
        async fn rpc(&mut self, body: FCall) -> FCall {
            self.tag += 1;
            let mut writer = bytes::BytesMut::new().writer();
            serialize::write_msg(&mut writer, &Msg { tag: self.tag, body }).unwrap();
            self.framed.send(writer.into_inner().freeze()).await.unwrap();

            let bytes = self.framed.next().await.unwrap().unwrap();
            let msg = serialize::read_msg(&mut bytes.reader()).unwrap();
            assert_eq!(msg.tag, self.tag);
            msg.body
        }

        async fn walk(&mut self, fid: u32, newfid: u32, names: &[&str]) -> FCall {
            let wnames = names.iter().map(|s| s.to_string()).collect();
            self.rpc(FCall::TWalk { fid, newfid, wnames }).await
        }
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("p9export-main-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn connect(root: PathBuf, read_only: bool) -> Client {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let export = Export {
            root,
            read_only,
            max_depth: 8,
        };
        tokio::spawn(dispatch(Arc::new(export), Config { msize: 8192 }, reader, writer));

        let framed = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_framed(client);
        let mut c = Client { framed, tag: 0 };

        let version = FCall::TVersion {
            msize: 8192,
            version: P92000.to_owned(),
        };
        assert!(matches!(c.rpc(version).await, FCall::RVersion { .. }));
        let attach = FCall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: String::new(),
        };
        assert!(matches!(c.rpc(attach).await, FCall::RAttach { .. }));
        c
    }

    fn ename(body: FCall) -> String {
        match body {
            FCall::RError { ename } => ename,
            body => panic!("expected Rerror, got {:?}", body),
        }
    }

    #[test]
    fn write_flags() {
        assert!(!writes(OFlag::O_RDONLY));
        assert!(writes(OFlag::O_WRONLY));
        assert!(writes(OFlag::O_RDONLY | OFlag::O_TRUNC));
    }

    #[tokio::test]
    async fn create_write_read_remove() {
        let root = scratch("rw");
        let mut c = connect(root.clone(), false).await;

        assert_eq!(c.walk(0, 1, &[]).await, FCall::RWalk { wqids: vec![] });
        let create = FCall::TCreate {
            fid: 1,
            name: "notes".to_owned(),
            perm: 0o644,
            mode: om::RDWR,
        };
        assert!(matches!(c.rpc(create).await, FCall::RCreate { .. }));

        let write = FCall::TWrite {
            fid: 1,
            offset: 0,
            data: Data(b"hello, world".to_vec()),
        };
        assert_eq!(c.rpc(write).await, FCall::RWrite { count: 12 });

        let read = FCall::TRead {
            fid: 1,
            offset: 7,
            count: 100,
        };
        assert_eq!(
            c.rpc(read).await,
            FCall::RRead {
                data: Data(b"world".to_vec())
            }
        );
        assert_eq!(c.rpc(FCall::TClunk { fid: 1 }).await, FCall::RClunk);
        assert_eq!(std::fs::read(root.join("notes")).unwrap(), b"hello, world");

        match c.walk(0, 2, &["notes"]).await {
            FCall::RWalk { wqids } => assert_eq!(wqids.len(), 1),
            body => panic!("unexpected {:?}", body),
        }
        match c.rpc(FCall::TStat { fid: 2 }).await {
            FCall::RStat { stat } => {
                assert_eq!(stat.name, "notes");
                assert_eq!(stat.length, 12);
                assert_eq!(stat.mode & dm::DIR, 0);
            }
            body => panic!("unexpected {:?}", body),
        }
        assert_eq!(c.rpc(FCall::TRemove { fid: 2 }).await, FCall::RRemove);
        assert!(!root.join("notes").exists());
        assert_eq!(
            ename(c.rpc(FCall::TStat { fid: 2 }).await),
            "unknown fid 2"
        );

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn directory_listing_and_confinement() {
        let root = scratch("ls");
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("motd"), b"hi").unwrap();
        let mut c = connect(root.clone(), true).await;

        assert_eq!(c.walk(0, 1, &[]).await, FCall::RWalk { wqids: vec![] });
        assert!(matches!(
            c.rpc(FCall::TOpen { fid: 1, mode: om::READ }).await,
            FCall::ROpen { qid, .. } if qid.typ.contains(QIdType::DIR)
        ));
        let read = FCall::TRead {
            fid: 1,
            offset: 0,
            count: 4096,
        };
        let data = match c.rpc(read).await {
            FCall::RRead { data } => data.0,
            body => panic!("unexpected {:?}", body),
        };
        let mut cursor = std::io::Cursor::new(&data[..]);
        let mut names = Vec::new();
        while (cursor.position() as usize) < data.len() {
            let stat: Stat = Decodable::decode(&mut cursor).unwrap();
            names.push(stat.name);
        }
        names.sort();
        assert_eq!(names, vec!["motd", "sub"]);

        // ".." at the export root stays at the root
        match c.walk(0, 2, &["..", "..", "motd"]).await {
            FCall::RWalk { wqids } => assert_eq!(wqids.len(), 3),
            body => panic!("unexpected {:?}", body),
        }
        match c.rpc(FCall::TStat { fid: 2 }).await {
            FCall::RStat { stat } => assert_eq!((stat.name.as_str(), stat.length), ("motd", 2)),
            body => panic!("unexpected {:?}", body),
        }
        assert_eq!(
            ename(c.walk(0, 4, &["nonexistent"]).await),
            errstr::ENOENT
        );

        match c.walk(0, 3, &["motd"]).await {
            FCall::RWalk { wqids } => assert_eq!(wqids.len(), 1),
            body => panic!("unexpected {:?}", body),
        }
        assert_eq!(
            ename(c.rpc(FCall::TOpen { fid: 3, mode: om::WRITE }).await),
            errstr::EROFS
        );
        assert_eq!(ename(c.rpc(FCall::TRemove { fid: 3 }).await), errstr::EROFS);
        assert!(root.join("motd").exists());

        std::fs::remove_dir_all(&root).unwrap();
    }
}
