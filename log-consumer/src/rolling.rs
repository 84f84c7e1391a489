use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use tracing::info;

pub const DEFAULT_SUFFIX_FORMAT: &str = "%Y%m%d%H%M%S";

/// An append-only file that moves itself aside once it grows too large or too old.
///
/// Rotation only happens between two `write` calls, so a single write never
/// spans two files.
pub struct RollingFile {
    path: PathBuf,
    max_size: u64,
    max_age: Option<Duration>,
    suffix_format: String,
    file: File,
    size: u64,
    opened_at: DateTime<Utc>,
}

impl RollingFile {
    /// `max_size` is in bytes and `max_age` in seconds. 0 disables either limit.
    pub fn open(
        path: impl Into<PathBuf>,
        max_size: u64,
        max_age_secs: u64,
        suffix_format: Option<&str>,
    ) -> io::Result<Self> {
        let path = path.into();
        let suffix_format = suffix_format.unwrap_or(DEFAULT_SUFFIX_FORMAT).to_string();

        if suffix_format.is_empty()
            || StrftimeItems::new(&suffix_format).any(|item| matches!(item, Item::Error))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid rotation suffix format: {suffix_format}"),
            ));
        }

        let (file, size) = open_append(&path)?;

        Ok(Self {
            path,
            max_size,
            max_age: (max_age_secs > 0).then(|| Duration::from_secs(max_age_secs)),
            suffix_format,
            file,
            size,
            opened_at: Utc::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn should_rotate(&self, incoming: u64, now: DateTime<Utc>) -> bool {
        if self.size == 0 {
            return false;
        }

        let too_large = self.max_size > 0 && self.size + incoming > self.max_size;
        let too_old = self.max_age.is_some_and(|max_age| {
            (now - self.opened_at)
                .to_std()
                .is_ok_and(|age| age >= max_age)
        });

        too_large || too_old
    }

    fn rotate(&mut self, now: DateTime<Utc>) -> io::Result<()> {
        self.file.flush()?;

        let suffix = now.format(&self.suffix_format).to_string();
        let rotated = self.rotated_path(&suffix);
        fs::rename(&self.path, &rotated)?;
        info!(
            from = %self.path.display(),
            to = %rotated.display(),
            size = self.size,
            "Rotated sink file"
        );

        let (file, size) = open_append(&self.path)?;
        self.file = file;
        self.size = size;
        self.opened_at = now;
        Ok(())
    }

    // filename.<suffix>, then filename.<suffix>.1, .2, ... while taken
    fn rotated_path(&self, suffix: &str) -> PathBuf {
        let base = with_extension(&self.path, suffix);
        let mut candidate = base.clone();
        let mut n = 1;
        while candidate.exists() {
            candidate = with_extension(&base, &n.to_string());
            n += 1;
        }
        candidate
    }

    pub(crate) fn write_at(&mut self, buf: &[u8], now: DateTime<Utc>) -> io::Result<usize> {
        if self.should_rotate(buf.len() as u64, now) {
            self.rotate(now)?;
        }

        self.file.write_all(buf)?;
        self.size += buf.len() as u64;
        Ok(buf.len())
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_at(buf, Utc::now())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let size = file.metadata()?.len();
    Ok((file, size))
}

fn with_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}
