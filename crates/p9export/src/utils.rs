use {
    async_trait::async_trait,
    log::warn,
    ninep_session::{conn::Conn, fcall::*, file::FileIo, io_err, serialize::Encodable, utils::join_path},
    nix::unistd::{Gid, Group, Uid, User},
    std::{
        fs::Metadata,
        io::{self, SeekFrom},
        os::unix::prelude::*,
        path::PathBuf,
        sync::Arc,
    },
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
        sync::Mutex,
    },
    tokio_stream::{StreamExt, wrappers::ReadDirStream},
};

pub fn qid_type(attr: &Metadata) -> QIdType {
    From::from(attr.file_type())
}

pub fn mode_from_attr(attr: &Metadata) -> u32 {
    let typ = attr.file_type();
    let mut mode = attr.permissions().mode() & 0o777;
    if typ.is_dir() {
        mode |= dm::DIR;
    }
    if typ.is_symlink() {
        mode |= dm::SYMLINK;
    }
    mode
}

fn user_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) if user.name.len() <= MAX_UID_LEN => user.name,
        _ => uid.to_string(),
    }
}

fn group_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) if group.name.len() <= MAX_UID_LEN => group.name,
        _ => gid.to_string(),
    }
}

pub fn stat_from_attr(attr: &Metadata, name: &str, qid: QId) -> Stat {
    let uid = user_name(attr.uid());
    Stat {
        typ: 0,
        dev: 0,
        qid,
        mode: mode_from_attr(attr),
        atime: attr.atime() as u32,
        mtime: attr.mtime() as u32,
        length: if attr.is_dir() { 0 } else { attr.len() },
        name: name.to_owned(),
        uid: uid.clone(),
        gid: group_name(attr.gid()),
        muid: uid,
    }
}

/// Last element of a cleaned 9P path; the root is "/".
pub fn base_name(path: &str) -> &str {
    match path.rsplit('/').next() {
        Some("") | None => "/",
        Some(name) => name,
    }
}

/// An open regular file.
pub struct LocalFile {
    file: Mutex<fs::File>,
}

impl LocalFile {
    pub fn new(file: fs::File) -> Self {
        LocalFile {
            file: Mutex::new(file),
        }
    }
}

#[async_trait]
impl FileIo for LocalFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read(buf).await
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        self.file.lock().await.flush().await
    }
}

/// An open directory. Reads return the stat records of its entries,
/// never splitting a record; offsets must fall on record boundaries.
pub struct DirFile {
    conn: Arc<Conn>,
    path: String,
    realpath: PathBuf,
    records: Mutex<Vec<Vec<u8>>>,
}

impl DirFile {
    pub fn new(conn: Arc<Conn>, path: &str, realpath: PathBuf) -> Self {
        DirFile {
            conn,
            path: path.to_owned(),
            realpath,
            records: Mutex::new(Vec::new()),
        }
    }

    async fn list(&self) -> io::Result<Vec<Vec<u8>>> {
        let mut entries = ReadDirStream::new(fs::read_dir(&self.realpath).await?);
        let mut records = Vec::new();

        while let Some(entry) = entries.next().await {
            let entry = entry?;
            let attr = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let qid = self
                .conn
                .qid(&join_path(&self.path, &[&name]), qid_type(&attr));

            let mut record = Vec::new();
            match stat_from_attr(&attr, &name, qid).encode(&mut record) {
                Ok(_) => records.push(record),
                Err(e) => warn!("skipping {:?} in {:?}: {}", name, self.realpath, e),
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl FileIo for DirFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut records = self.records.lock().await;
        // a read from the start rereads the directory
        if offset == 0 {
            *records = self.list().await?;
        }

        let mut pos = 0;
        let mut skip = 0;
        while skip < records.len() && pos < offset {
            pos += records[skip].len() as u64;
            skip += 1;
        }
        if pos > offset {
            return Err(io_err!(InvalidInput, "directory offset splits an entry"));
        }

        let mut n = 0;
        for record in &records[skip..] {
            if n + record.len() > buf.len() {
                break;
            }
            buf[n..n + record.len()].copy_from_slice(record);
            n += record.len();
        }
        Ok(n)
    }

    async fn write_at(&self, _: &[u8], _: u64) -> io::Result<usize> {
        Err(io::Error::from(nix::errno::Errno::EISDIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ninep_session::serialize::Decodable;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("p9export-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn base_names() {
        assert_eq!(base_name("/"), "/");
        assert_eq!(base_name("/usr"), "usr");
        assert_eq!(base_name("/usr/glenda/lib"), "lib");
    }

    #[test]
    fn stat_mode_and_length() {
        let dir = scratch("stat");
        std::fs::write(dir.join("f"), b"12345").unwrap();

        let attr = std::fs::symlink_metadata(dir.join("f")).unwrap();
        let stat = stat_from_attr(&attr, "f", QId::default());
        assert_eq!(stat.length, 5);
        assert_eq!(stat.mode & dm::DIR, 0);
        assert_eq!(stat.mode & 0o777, attr.permissions().mode() & 0o777);
        assert!(stat.fits());

        let attr = std::fs::symlink_metadata(&dir).unwrap();
        let stat = stat_from_attr(&attr, "d", QId::default());
        assert_ne!(stat.mode & dm::DIR, 0);
        assert_eq!(stat.length, 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn directory_reads_whole_records() {
        let dir = scratch("readdir");
        std::fs::write(dir.join("a"), b"").unwrap();
        std::fs::write(dir.join("bb"), b"").unwrap();

        let (conn, _rx) = Conn::new(8192);
        let file = DirFile::new(conn, "/", dir.clone());

        let mut buf = vec![0; 4096];
        let n = file.read_at(&mut buf, 0).await.unwrap();
        let mut cursor = io::Cursor::new(&buf[..n]);
        let mut names = Vec::new();
        while (cursor.position() as usize) < n {
            let stat: Stat = Decodable::decode(&mut cursor).unwrap();
            names.push(stat.name);
        }
        names.sort();
        assert_eq!(names, vec!["a", "bb"]);

        // room for exactly one record
        let first = (u16::from_le_bytes([buf[0], buf[1]]) + 2) as usize;
        let mut small = vec![0; first + 1];
        assert_eq!(file.read_at(&mut small, 0).await.unwrap(), first);
        assert_eq!(file.read_at(&mut small, n as u64).await.unwrap(), 0);
        assert!(file.read_at(&mut small, 1).await.is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
