use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};

/// Append-only log sink that switches to `<stem>.<YYYY-MM-DD>.log` when the local date changes.
pub struct DailyLogFile {
    dir: PathBuf,
    stem: String,
    current: Option<(NaiveDate, File)>,
}

impl DailyLogFile {
    pub fn new(dir: &Path, stem: impl Into<String>) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            stem: stem.into(),
            current: None,
        })
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}.{}.log", self.stem, date.format("%Y-%m-%d")))
    }

    fn file(&mut self) -> io::Result<&mut File> {
        let today = Local::now().date_naive();
        let stale = !matches!(&self.current, Some((date, _)) if *date == today);
        if stale {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(today))?;
            self.current = Some((today, file));
        }
        match self.current.as_mut() {
            Some((_, file)) => Ok(file),
            None => Err(io::Error::new(io::ErrorKind::Other, "log file not open")),
        }
    }
}

impl Write for DailyLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some((_, file)) => file.flush(),
            None => Ok(()),
        }
    }
}
