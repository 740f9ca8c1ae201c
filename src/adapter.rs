//! Translates FUSE's low-level entry points into [`crate::index::Index`]
//! mutations and raw I/O on opaque names in the flat backing directory.

use crate::index::{Entry, Index};
use anyhow::{anyhow, Result};
use core::ffi::*;
use fuse_sys::*;
use log::debug;
use std::env;
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use umask::Mode;

pub struct ObfusFs {
    backing_root: PathBuf,
    index: Index,
    debug: bool,
    foreground: bool,
}

impl ObfusFs {
    pub fn options() -> ObfusFsBuilder {
        ObfusFsBuilder::new()
    }

    pub fn new(data_dir: impl AsRef<Path>, password: impl Into<Vec<u8>>) -> crate::error::Result<Self> {
        Self::options().build(data_dir, password)
    }

    pub fn mount(mut self, mount: impl AsRef<str>) -> anyhow::Result<()> {
        let exec = env::args().next().unwrap_or_else(|| "obfusfs".to_string());

        let mut args = vec![exec.as_str(), mount.as_ref()];
        if self.debug {
            args.push("-d");
        }
        if self.foreground {
            args.push("-f");
        }

        self.run(&args)
            .map_err(|err| anyhow!("unexpected FUSE error: {err}"))
    }

    fn backing_path(&self, opaque_name: &str) -> String {
        format!("./{opaque_name}")
    }
}

impl UnthreadedFileSystem for ObfusFs {
    fn fsinit(&mut self) -> Result<()> {
        debug!("fsinit: chdir to {}", self.backing_root.display());
        env::set_current_dir(&self.backing_root)?;
        Ok(())
    }

    fn getattr(
        &mut self,
        path: &str,
        stbuf: Option<&mut stat>,
        _fi: Option<&mut fuse_file_info>,
    ) -> Result<i32> {
        debug!("getattr: path = {path}");

        let entry = match self.index.get(path) {
            Ok(entry) => entry,
            Err(err) => return Ok(err.errno()),
        };
        let Some(stbuf) = stbuf else {
            return Ok(0);
        };

        match entry {
            Entry::Directory {
                uid,
                gid,
                mode,
                atime,
                mtime,
                ctime,
                num_subdirs,
                ..
            } => {
                unsafe {
                    std::ptr::write_bytes(stbuf as *mut stat as *mut u8, 0, std::mem::size_of::<stat>());
                }
                stbuf.st_mode = libc::S_IFDIR | mode;
                stbuf.st_nlink = (2 + num_subdirs) as _;
                stbuf.st_size = 4096;
                stbuf.st_uid = uid;
                stbuf.st_gid = gid;

                // st_atime/st_mtime/st_ctime are C macros, not real struct
                // members; bindgen only emits st_atim/st_mtim/st_ctim. Go
                // through libc::stat, which does define the macro names as
                // real fields, the same way the file branch below does.
                let raw = stbuf as *mut stat as *mut libc::stat;
                unsafe {
                    (*raw).st_atime = atime as _;
                    (*raw).st_mtime = mtime as _;
                    (*raw).st_ctime = ctime as _;
                }
                Ok(0)
            }
            Entry::File { opaque_name, .. } => {
                let cpath = CString::new(self.backing_path(&opaque_name))?;
                let res = unsafe { libc::lstat(cpath.as_ptr(), stbuf as *mut stat as *mut libc::stat) };
                if res == 0 {
                    Ok(0)
                } else {
                    Ok(-io_errno())
                }
            }
        }
    }

    fn readlink(&mut self, path: &str, _buf: &mut [u8]) -> Result<i32> {
        debug!("readlink: path = {path} (unsupported)");
        Ok(-libc::ENOSYS)
    }

    fn mknod(&mut self, path: &str, mode: mode_t, dev: libc::dev_t) -> Result<i32> {
        debug!("mknod: path = {path}, mode = {}", Mode::from(mode));

        let entry = match self.index.create_file(path) {
            Ok(entry) => entry,
            Err(err) => return Ok(err.errno()),
        };

        let cpath = CString::new(self.backing_path(entry.opaque_name()))?;
        let res = unsafe { libc::mknod(cpath.as_ptr(), mode, dev) };
        if res == 0 {
            Ok(0)
        } else {
            Ok(-io_errno())
        }
    }

    fn mkdir(&mut self, path: &str, mode: mode_t) -> Result<i32> {
        debug!("mkdir: path = {path}, mode = {}", Mode::from(mode));
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        match self.index.mkdir(path, uid, gid, mode) {
            Ok(_) => Ok(0),
            Err(err) => Ok(err.errno()),
        }
    }

    fn unlink(&mut self, path: &str) -> Result<i32> {
        debug!("unlink: path = {path}");

        let entry = match self.index.get(path) {
            Ok(entry) => entry,
            Err(err) => return Ok(err.errno()),
        };
        if entry.is_directory() {
            return Ok(-libc::EISDIR);
        }

        let cpath = CString::new(self.backing_path(entry.opaque_name()))?;
        if unsafe { libc::unlink(cpath.as_ptr()) } != 0 {
            return Ok(-io_errno());
        }

        match self.index.unlink(path) {
            Ok(()) => Ok(0),
            Err(err) => Ok(err.errno()),
        }
    }

    fn rmdir(&mut self, path: &str) -> Result<i32> {
        debug!("rmdir: path = {path}");
        match self.index.rmdir(path) {
            Ok(()) => Ok(0),
            Err(err) => Ok(err.errno()),
        }
    }

    fn symlink(&mut self, from: &str, to: &str) -> Result<i32> {
        debug!("symlink: from = {from}, to = {to} (unsupported)");
        Ok(-libc::ENOSYS)
    }

    fn rename(&mut self, from: &str, to: &str, _flags: c_uint) -> Result<i32> {
        debug!("rename: from = {from}, to = {to}");

        let src = match self.index.get(from) {
            Ok(entry) => entry,
            Err(err) => return Ok(err.errno()),
        };

        if src.is_directory() {
            // The flat backing layout has no on-disk footprint for
            // directories, but moving a directory subtree through the
            // index is not implemented; matches the reference's behavior
            // of failing this case rather than silently corrupting it.
            return Ok(-libc::ENOENT);
        }

        let dst = match self.index.get_or_create_file(to) {
            Ok(entry) => entry,
            Err(err) => return Ok(err.errno()),
        };

        let from_path = CString::new(self.backing_path(src.opaque_name()))?;
        let to_path = CString::new(self.backing_path(dst.opaque_name()))?;
        if unsafe { libc::rename(from_path.as_ptr(), to_path.as_ptr()) } != 0 {
            return Ok(-io_errno());
        }

        match self.index.unlink(from) {
            Ok(()) => Ok(0),
            Err(err) => Ok(err.errno()),
        }
    }

    fn link(&mut self, from: &str, to: &str) -> Result<i32> {
        debug!("link: from = {from}, to = {to} (unsupported)");
        Ok(-libc::ENOSYS)
    }

    fn chmod(&mut self, path: &str, mode: mode_t, _fi: Option<&mut fuse_file_info>) -> Result<i32> {
        debug!("chmod: path = {path}, mode = {}", Mode::from(mode));

        let entry = match self.index.get(path) {
            Ok(entry) => entry,
            Err(err) => return Ok(err.errno()),
        };

        if entry.is_directory() {
            return match self.index.set_dir_mode(path, mode) {
                Ok(()) => Ok(0),
                Err(err) => Ok(err.errno()),
            };
        }

        let cpath = CString::new(self.backing_path(entry.opaque_name()))?;
        if unsafe { libc::chmod(cpath.as_ptr(), mode) } == 0 {
            Ok(0)
        } else {
            Ok(-io_errno())
        }
    }

    fn chown(&mut self, path: &str, uid: uid_t, gid: gid_t, _fi: Option<&mut fuse_file_info>) -> Result<i32> {
        debug!("chown: path = {path}, uid = {uid}, gid = {gid}");

        let entry = match self.index.get(path) {
            Ok(entry) => entry,
            Err(err) => return Ok(err.errno()),
        };

        if entry.is_directory() {
            return match self.index.set_dir_owner(path, uid, gid) {
                Ok(()) => Ok(0),
                Err(err) => Ok(err.errno()),
            };
        }

        let cpath = CString::new(self.backing_path(entry.opaque_name()))?;
        if unsafe { libc::chown(cpath.as_ptr(), uid, gid) } == 0 {
            Ok(0)
        } else {
            Ok(-io_errno())
        }
    }

    fn truncate(&mut self, path: &str, size: off_t, _fi: Option<&mut fuse_file_info>) -> Result<i32> {
        debug!("truncate: path = {path}, size = {size}");

        let entry = match self.index.get(path) {
            Ok(entry) => entry,
            Err(err) => return Ok(err.errno()),
        };

        let file = match OpenOptions::new()
            .append(true)
            .open(self.backing_path(entry.opaque_name()))
        {
            Ok(file) => file,
            Err(err) => return Ok(-err.raw_os_error().unwrap_or(libc::EIO)),
        };
        match file.set_len(size as u64) {
            Ok(()) => Ok(0),
            Err(err) => Ok(-err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn open(&mut self, path: &str, _fi: Option<&mut fuse_file_info>) -> Result<i32> {
        debug!("open: path = {path}");
        Ok(0)
    }

    fn read(
        &mut self,
        path: &str,
        buf: &mut [u8],
        offset: off_t,
        _fi: Option<&mut fuse_file_info>,
    ) -> Result<i32> {
        debug!("read: path = {path}, offset = {offset}, size = {}", buf.len());

        let entry = match self.index.get(path) {
            Ok(entry) => entry,
            Err(err) => return Ok(err.errno()),
        };

        let mut file = match fs::File::open(self.backing_path(entry.opaque_name())) {
            Ok(file) => file,
            Err(err) => return Ok(-err.raw_os_error().unwrap_or(libc::EIO)),
        };
        if let Err(err) = file.seek(SeekFrom::Start(offset as u64)) {
            return Ok(-err.raw_os_error().unwrap_or(libc::EIO));
        }
        match file.read(buf) {
            Ok(n) => Ok(n as i32),
            Err(err) => Ok(-err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn write(&mut self, path: &str, buf: &[u8], offset: off_t, _fi: Option<&mut fuse_file_info>) -> Result<i32> {
        debug!("write: path = {path}, offset = {offset}, size = {}", buf.len());

        let entry = match self.index.get_or_create_file(path) {
            Ok(entry) => entry,
            Err(err) => return Ok(err.errno()),
        };

        // Truncate-then-write: reproduces the reference's documented (and
        // documented-as-a-limitation) behavior of discarding any existing
        // content beyond what this call writes. See the crate's design
        // notes for why this is kept rather than "fixed".
        let mut file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.backing_path(entry.opaque_name()))
        {
            Ok(file) => file,
            Err(err) => return Ok(-err.raw_os_error().unwrap_or(libc::EIO)),
        };
        if let Err(err) = file.seek(SeekFrom::Start(offset as u64)) {
            return Ok(-err.raw_os_error().unwrap_or(libc::EIO));
        }
        match file.write(buf) {
            Ok(n) => Ok(n as i32),
            Err(err) => Ok(-err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn statfs(&mut self, _path: &str, stbuf: Option<&mut statvfs>) -> Result<i32> {
        debug!("statfs");
        let Some(stbuf) = stbuf else {
            return Ok(0);
        };
        let cpath = CString::new(".")?;
        let res = unsafe { libc::statvfs(cpath.as_ptr(), stbuf as *mut statvfs as *mut libc::statvfs) };
        if res == 0 {
            Ok(0)
        } else {
            Ok(-io_errno())
        }
    }

    fn flush(&mut self, path: &str, _fi: Option<&mut fuse_file_info>) -> Result<i32> {
        debug!("flush: path = {path}");
        Ok(0)
    }

    fn release(&mut self, path: &str, _fi: Option<&mut fuse_file_info>) -> Result<i32> {
        debug!("release: path = {path}");
        Ok(0)
    }

    fn fsync(&mut self, path: &str, _isdatasync: c_int, _fi: Option<&mut fuse_file_info>) -> Result<i32> {
        debug!("fsync: path = {path}");
        Ok(0)
    }

    fn opendir(&mut self, path: &str, _fi: Option<&mut fuse_file_info>) -> Result<i32> {
        debug!("opendir: path = {path}");
        Ok(0)
    }

    fn readdir(
        &mut self,
        path: &str,
        buf: Option<&mut c_void>,
        filler: fuse_fill_dir_t,
        _offset: off_t,
        _fi: Option<&mut fuse_file_info>,
        _flags: fuse_readdir_flags,
    ) -> Result<i32> {
        debug!("readdir: path = {path}");

        let names = match self.index.children_of(path) {
            Ok(names) => names,
            Err(err) => return Ok(err.errno()),
        };

        let Some(filler) = filler else {
            return Ok(0);
        };
        let buf_ptr = buf.map(|b| b as *mut c_void).unwrap_or(std::ptr::null_mut());

        for name in names {
            let cname = CString::new(name)?;
            unsafe {
                filler(buf_ptr, cname.as_ptr(), std::ptr::null(), 0, 0 as _);
            }
        }
        Ok(0)
    }

    fn releasedir(&mut self, path: &str, _fi: Option<&mut fuse_file_info>) -> Result<i32> {
        debug!("releasedir: path = {path}");
        Ok(0)
    }

    fn access(&mut self, path: &str, _mask: c_int) -> Result<i32> {
        debug!("access: path = {path}");
        Ok(0)
    }

    fn create(&mut self, path: &str, mode: mode_t, _fi: Option<&mut fuse_file_info>) -> Result<i32> {
        debug!("create: path = {path}, mode = {}", Mode::from(mode));

        let entry = match self.index.create_file(path) {
            Ok(entry) => entry,
            Err(err) => return Ok(err.errno()),
        };

        match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.backing_path(entry.opaque_name()))
        {
            Ok(_) => Ok(0),
            Err(err) => Ok(-err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn flock(&mut self, path: &str, _fi: Option<&mut fuse_file_info>, _op: c_int) -> Result<i32> {
        debug!("flock: path = {path} (no-op)");
        Ok(0)
    }

    fn lock(
        &mut self,
        path: &str,
        _fi: Option<&mut fuse_file_info>,
        _cmd: c_int,
        _lock: Option<&mut flock>,
    ) -> Result<i32> {
        debug!("lock: path = {path} (no-op)");
        Ok(0)
    }
}

fn io_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

pub struct ObfusFsBuilder {
    debug: bool,
    foreground: bool,
}

impl ObfusFsBuilder {
    fn new() -> Self {
        Self {
            debug: true,
            foreground: true,
        }
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn foreground(mut self, foreground: bool) -> Self {
        self.foreground = foreground;
        self
    }

    pub fn build(self, data_dir: impl AsRef<Path>, password: impl Into<Vec<u8>>) -> crate::error::Result<ObfusFs> {
        let backing_root = data_dir.as_ref().to_path_buf();
        let db_path = backing_root.join("obfusfs.db");
        let index = Index::load_or_create(db_path, password.into())?;

        Ok(ObfusFs {
            backing_root,
            index,
            debug: self.debug,
            foreground: self.foreground,
        })
    }
}
