//! Package archives and their metadata sidecars
//!
//! Archives and sidecars are written to a hidden temporary sibling and
//! renamed into place, so readers only ever see complete files.

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use log::debug;
use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::core::error::{Error, Result};

/// Delay between lock acquisition attempts
const LOCK_RETRY: Duration = Duration::from_millis(100);

/// Archive format of a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compression {
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar.gz")]
    TarGz,
}

impl Compression {
    /// File extension, also the canonical name
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Zip => "zip",
            Compression::TarGz => "tar.gz",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "zip" => Ok(Compression::Zip),
            "tar" | "tar.gz" | "tgz" => Ok(Compression::TarGz),
            other => Err(Error::InvalidInput(format!(
                "unsupported compression '{other}', expected zip or tar.gz"
            ))),
        }
    }
}

/// JSON metadata written next to an archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSidecar {
    pub job_id: i64,
    /// Archive file name, relative to the sidecar's directory
    pub filepath: String,
    pub name: String,
    pub description: String,
    /// The job's box in canonical `minx,miny,maxx,maxy` form, so `1.50`
    /// reads `1.5` and `-10.0` reads `-10`
    pub extent: String,
    pub last_modified: DateTime<Utc>,
}

/// All regular files below `dir`, sorted; empty if `dir` does not exist
pub fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound && current == dir => {
                return Ok(files)
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Remove `dir` and everything below it; a missing directory is fine
pub fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Archive every file under `source_dir` into `dest`
pub fn pack(source_dir: &Path, dest: &Path, kind: Compression) -> Result<()> {
    let files = collect_files(source_dir)?;
    pack_files(&files, source_dir, dest, kind)
}

/// Archive `files` into `dest`, storing paths relative to `base`
///
/// An existing archive at `dest` is replaced.
pub fn pack_files(files: &[PathBuf], base: &Path, dest: &Path, kind: Compression) -> Result<()> {
    let entries = files
        .iter()
        .map(|path| archive_name(path, base).map(|name| (path, name)))
        .collect::<Result<Vec<_>>>()?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp = temp_sibling(dest);
    let written = match kind {
        Compression::Zip => write_zip(&entries, &temp),
        Compression::TarGz => write_tar_gz(&entries, &temp),
    };
    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }

    fs::rename(&temp, dest)?;
    debug!("Packed {} files into {}", entries.len(), dest.display());
    Ok(())
}

/// Write the sidecar as pretty JSON, atomically
pub fn write_sidecar(path: &Path, sidecar: &PackageSidecar) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp = temp_sibling(path);
    let json = serde_json::to_string_pretty(sidecar)?;
    fs::write(&temp, json)?;
    fs::rename(&temp, path)?;
    Ok(())
}

pub fn read_sidecar(path: &Path) -> Result<PackageSidecar> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn archive_name(path: &Path, base: &Path) -> Result<String> {
    let relative = path.strip_prefix(base).map_err(|_| {
        Error::InvalidInput(format!(
            "{} is not below {}",
            path.display(),
            base.display()
        ))
    })?;

    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_zip(entries: &[(&PathBuf, String)], dest: &Path) -> Result<()> {
    let mut zip = ZipWriter::new(File::create(dest)?);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    for (path, name) in entries {
        zip.start_file(name.as_str(), options)?;
        io::copy(&mut File::open(path)?, &mut zip)?;
    }

    zip.finish()?.sync_all()?;
    Ok(())
}

fn write_tar_gz(entries: &[(&PathBuf, String)], dest: &Path) -> Result<()> {
    let encoder = GzEncoder::new(File::create(dest)?, flate2::Compression::default());
    let mut tar = tar::Builder::new(encoder);

    for (path, name) in entries {
        tar.append_path_with_name(path, name)?;
    }

    tar.into_inner()?.finish()?.sync_all()?;
    Ok(())
}

/// Advisory lock on a directory, held on `<dir>.lock`
///
/// The lock is an exclusive `flock` on the lock file, so the kernel drops it
/// when the holder exits, crashed or not. The file itself stays behind and
/// only records the last holder's pid.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    // Closing the file releases the lock
    _file: File,
}

impl DirLock {
    pub fn lock_path(dir: &Path) -> PathBuf {
        let mut path = dir.as_os_str().to_owned();
        path.push(".lock");
        PathBuf::from(path)
    }

    /// Take the lock, retrying until `timeout` elapses
    pub async fn acquire(dir: &Path, timeout: Duration) -> Result<DirLock> {
        let path = Self::lock_path(dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let deadline = tokio::time::Instant::now() + timeout;
        while !try_lock_exclusive(&file)? {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::LockTimeout(path.display().to_string()));
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!("Locked {}", dir.display());
        Ok(DirLock { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor belongs to `file` and outlives the call
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
    log::warn!("Directory locks are not enforced on this platform");
    Ok(true)
}
