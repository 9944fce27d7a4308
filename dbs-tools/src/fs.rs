//! Low level file system helpers (unix only).

use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;

use anyhow::{bail, format_err, Error};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

fn mode_from_bits(mode: u32) -> Result<Mode, Error> {
    Mode::from_bits(mode).ok_or_else(|| format_err!("invalid file mode {:o}", mode))
}

/// Create a directory with the given mode. Existing directories are fine.
pub fn create_dir<P: AsRef<Path>>(path: P, mode: u32) -> Result<bool, Error> {
    let path = path.as_ref();
    match nix::unistd::mkdir(path, mode_from_bits(mode)?) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::EEXIST) => {
            if !path.is_dir() {
                bail!("{path:?} exists and is not a directory");
            }
            Ok(false)
        }
        Err(err) => bail!("unable to create directory {path:?} - {err}"),
    }
}

/// Open a file with explicit flags and creation mode.
pub fn open_file<P: AsRef<Path>>(path: P, flags: OFlag, mode: u32) -> Result<File, Error> {
    let path = path.as_ref();
    let fd = nix::fcntl::open(path, flags | OFlag::O_CLOEXEC, mode_from_bits(mode)?)
        .map_err(|err| format_err!("unable to open {path:?} - {err}"))?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Open an existing file or create it with `mode`.
pub fn open_or_create_file<P: AsRef<Path>>(
    path: P,
    flags: OFlag,
    mode: u32,
) -> Result<(File, bool), Error> {
    let path = path.as_ref();
    match nix::fcntl::open(path, flags | OFlag::O_CLOEXEC, Mode::empty()) {
        Ok(fd) => Ok((unsafe { File::from_raw_fd(fd) }, false)),
        Err(nix::errno::Errno::ENOENT) => {
            let file = open_file(path, flags | OFlag::O_CREAT, mode)?;
            Ok((file, true))
        }
        Err(err) => bail!("unable to open {path:?} - {err}"),
    }
}

/// Atomically replace the contents of `path` via a temp file and rename.
pub fn replace_file<P: AsRef<Path>>(
    path: P,
    data: &[u8],
    mode: u32,
    fsync: bool,
) -> Result<(), Error> {
    use std::io::Write;

    let path = path.as_ref();
    let mut tmp_path = path.to_path_buf();
    tmp_path.set_extension("tmp");

    let mut file = open_file(
        &tmp_path,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        mode,
    )?;
    file.write_all(data)
        .map_err(|err| format_err!("writing {tmp_path:?} failed - {err}"))?;
    if fsync {
        nix::unistd::fsync(file.as_raw_fd())?;
    }
    drop(file);

    std::fs::rename(&tmp_path, path)
        .map_err(|err| format_err!("atomic rename to {path:?} failed - {err}"))?;
    if fsync {
        fsync_parent(path)?;
    }
    Ok(())
}

/// fdatasync an open file.
pub fn datasync(file: &File) -> Result<(), Error> {
    nix::unistd::fdatasync(file.as_raw_fd()).map_err(|err| format_err!("fdatasync failed - {err}"))
}

/// fsync the directory containing `path`, persisting renames and creates.
pub fn fsync_parent<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let parent = path
        .as_ref()
        .parent()
        .ok_or_else(|| format_err!("{:?} has no parent directory", path.as_ref()))?;
    let dir = File::open(parent)?;
    nix::unistd::fsync(dir.as_raw_fd())
        .map_err(|err| format_err!("fsync of {parent:?} failed - {err}"))
}

/// Take the single-instance lock of an engine directory.
///
/// The flock is held for the lifetime of the returned file.
pub fn lock_file_exclusive<P: AsRef<Path>>(path: P, mode: u32) -> Result<File, Error> {
    let path = path.as_ref();
    let (file, _created) = open_or_create_file(path, OFlag::O_RDWR, mode)?;
    nix::fcntl::flock(
        file.as_raw_fd(),
        nix::fcntl::FlockArg::LockExclusiveNonblock,
    )
    .map_err(|err| format_err!("unable to acquire lock {path:?} - {err}"))?;
    Ok(file)
}

#[cfg(test)]
mod test {
    use super::*;

    fn testdir(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("dbs-tools-fs-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn replace_file_roundtrip() {
        let dir = testdir("replace");
        let path = dir.join("record.json");
        replace_file(&path, b"first", 0o640, false).unwrap();
        replace_file(&path, b"second", 0o640, true).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn second_lock_fails() {
        let dir = testdir("lock");
        let path = dir.join("lock");
        let _guard = lock_file_exclusive(&path, 0o640).unwrap();
        assert!(lock_file_exclusive(&path, 0o640).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
