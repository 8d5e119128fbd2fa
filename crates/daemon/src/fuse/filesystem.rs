//! fuser `Filesystem` implementation over [`KvFs`]
//!
//! fuser calls in on its own session thread, so each request blocks on the
//! async translation layer through a handle to the daemon's tokio runtime.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tokio::runtime::Handle;

use common::{KvStore, NodeType};

use super::InodeTable;
use crate::config::Config;
use crate::fs::{FsStatus, KvFile, KvFs, NodeAttr};

const BLOCK_SIZE: u32 = 512;

/// Kernel-facing settings of a mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuseOptions {
    pub attr_ttl: Duration,
    pub entry_ttl: Duration,
    pub uid: u32,
    pub gid: u32,
}

impl Default for FuseOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for FuseOptions {
    fn from(config: &Config) -> Self {
        Self {
            attr_ttl: config.attr_ttl(),
            entry_ttl: config.entry_ttl(),
            uid: config.uid,
            gid: config.gid,
        }
    }
}

fn file_type(kind: NodeType) -> FileType {
    match kind {
        NodeType::Directory => FileType::Directory,
        NodeType::File => FileType::RegularFile,
    }
}

fn os_name(name: &OsStr) -> Result<&str, FsStatus> {
    // Keys are text; a name that is not cannot exist in the backend
    name.to_str().ok_or(FsStatus::NotFound)
}

pub struct KvFuse<S> {
    fs: KvFs<S>,
    runtime: Handle,
    options: FuseOptions,
    inodes: InodeTable,
    files: HashMap<u64, KvFile<S>>,
    next_fh: u64,
}

impl<S: KvStore> KvFuse<S> {
    pub fn new(fs: KvFs<S>, runtime: Handle, options: FuseOptions) -> Self {
        Self {
            fs,
            runtime,
            options,
            inodes: InodeTable::new(),
            files: HashMap::new(),
            next_fh: 1,
        }
    }

    fn file_attr(&self, ino: u64, attr: &NodeAttr) -> FileAttr {
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(BLOCK_SIZE as u64),
            atime: attr.mtime,
            mtime: attr.mtime,
            ctime: attr.mtime,
            crtime: attr.crtime,
            kind: file_type(attr.kind),
            perm: attr.perm,
            nlink: if attr.is_dir() { 2 } else { 1 },
            uid: self.options.uid,
            gid: self.options.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, FsStatus> {
        self.inodes
            .get_path(ino)
            .map(str::to_string)
            .ok_or(FsStatus::NotFound)
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<String, FsStatus> {
        let name = os_name(name)?;
        self.inodes.child_path(parent, name).ok_or(FsStatus::NotFound)
    }

    fn attr_of(&self, ino: u64) -> Result<FileAttr, FsStatus> {
        let path = self.path_of(ino)?;
        let attr = self.runtime.block_on(self.fs.get_attr(&path))?;
        Ok(self.file_attr(ino, &attr))
    }
}

impl<S: KvStore> Filesystem for KvFuse<S> {
    fn destroy(&mut self) {
        tracing::debug!(open_files = self.files.len(), "fuse session destroyed");
        self.files.clear();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(status) => return reply.error(status.to_errno()),
        };
        tracing::trace!(path = %path, "lookup");

        match self.runtime.block_on(self.fs.get_attr(&path)) {
            Ok(attr) => {
                let ino = self.inodes.get_or_create(&path);
                let attr = self.file_attr(ino, &attr);
                reply.entry(&self.options.entry_ttl, &attr, 0);
            }
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.attr_of(ino) {
            Ok(attr) => reply.attr(&self.options.attr_ttl, &attr),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(status) => return reply.error(status.to_errno()),
        };
        let file = self.fs.open(&path);

        let result = if let Some(size) = size {
            file.truncate(size)
        } else if let Some(mode) = mode {
            file.chmod(mode)
        } else if uid.is_some() || gid.is_some() {
            file.chown(uid, gid)
        } else if atime.is_some() || mtime.is_some() {
            file.utimens()
        } else {
            Ok(())
        };

        match result.and_then(|()| self.attr_of(ino)) {
            Ok(attr) => reply.attr(&self.options.attr_ttl, &attr),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let result = self
            .path_of(ino)
            .and_then(|path| self.runtime.block_on(self.fs.open_dir(&path)));
        match result {
            Ok(_) => reply.opened(0, 0),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(status) => return reply.error(status.to_errno()),
        };
        let children = match self.runtime.block_on(self.fs.open_dir(&path)) {
            Ok(children) => children,
            Err(status) => return reply.error(status.to_errno()),
        };

        let parent = self.inodes.parent_inode(ino);
        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent, FileType::Directory, "..".to_string()),
        ];
        for child in children {
            let child_ino = match self.inodes.child_path(ino, &child.name) {
                Some(child_path) => self.inodes.get_or_create(&child_path),
                None => continue,
            };
            entries.push((child_ino, file_type(child.kind), child.name));
        }

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(skip) {
            // true means the reply buffer is full
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(status) => return reply.error(status.to_errno()),
        };
        let fh = self.next_fh;
        self.next_fh += 1;
        self.files.insert(fh, self.fs.open(&path));
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        let result = match self.files.get(&fh) {
            Some(file) => self.runtime.block_on(file.read(offset, size as usize)),
            None => self.path_of(ino).and_then(|path| {
                let file = self.fs.open(&path);
                self.runtime.block_on(file.read(offset, size as usize))
            }),
        };
        match result {
            Ok(data) => reply.data(&data),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        let result = match self.files.get(&fh) {
            Some(file) => file.write(offset, data),
            None => self
                .path_of(ino)
                .and_then(|path| self.fs.open(&path).write(offset, data)),
        };
        match result {
            Ok(written) => reply.written(written),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.files.get(&fh).map(KvFile::flush).unwrap_or(Ok(())) {
            Ok(()) => reply.ok(),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.files.get(&fh).map(KvFile::fsync).unwrap_or(Ok(())) {
            Ok(()) => reply.ok(),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(file) = self.files.remove(&fh) {
            file.release();
        }
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        // The mount never creates nodes
        let status = self
            .child_of(parent, name)
            .and_then(|path| self.fs.create(&path))
            .err()
            .unwrap_or(FsStatus::PermissionDenied);
        reply.error(status.to_errno());
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let status = self
            .child_of(parent, name)
            .and_then(|path| self.fs.mkdir(&path))
            .err()
            .unwrap_or(FsStatus::PermissionDenied);
        reply.error(status.to_errno());
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self
            .child_of(parent, name)
            .and_then(|path| self.fs.rmdir(&path));
        match result {
            Ok(()) => reply.ok(),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(status) => return reply.error(status.to_errno()),
        };
        match self.runtime.block_on(self.fs.unlink(&path)) {
            Ok(()) => {
                self.inodes.remove_by_path(&path);
                reply.ok();
            }
            Err(status) => reply.error(status.to_errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use common::testkit::MemoryStore;

    use super::*;

    #[test]
    fn test_file_attr_conversion() {
        let fs = KvFs::new(MemoryStore::new());
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let options = FuseOptions {
            uid: 1000,
            gid: 100,
            ..FuseOptions::default()
        };
        let fuse = KvFuse::new(fs, runtime.handle().clone(), options);

        let started = SystemTime::UNIX_EPOCH;
        let attr = NodeAttr::for_node(&common::Node::file("/k", "hello"), started, started);
        let converted = fuse.file_attr(42, &attr);

        assert_eq!(converted.ino, 42);
        assert_eq!(converted.size, 5);
        assert_eq!(converted.kind, FileType::RegularFile);
        assert_eq!(converted.perm, 0o444);
        assert_eq!(converted.nlink, 1);
        assert_eq!(converted.uid, 1000);
        assert_eq!(converted.gid, 100);
        assert_eq!(converted.blocks, 1);
    }

    #[test]
    fn test_default_options() {
        let options = FuseOptions::default();
        assert_eq!(options.attr_ttl, Duration::from_secs(1));
        assert_eq!(options.entry_ttl, Duration::from_secs(1));
        assert_eq!((options.uid, options.gid), (0, 0));
    }
}
