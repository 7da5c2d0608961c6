//! Switchable log sink.
//!
//! Each thread carries its own sink so the embedder can redirect worker,
//! polling, and main-thread logs independently at runtime, and so a thread
//! can disable its logging on exit without silencing the others. Log lines
//! are prefixed with a timestamp and the emitting source location.

use std::cell::RefCell;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

enum Sink {
    Disabled,
    Stdout,
    Stderr,
    File { path: PathBuf, writer: BufWriter<File> },
}

thread_local! {
    static SINK: RefCell<Sink> = const { RefCell::new(Sink::Disabled) };
}

/// Append log lines for this thread to the file at `path`.
pub fn to_file(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    SINK.with(|sink| {
        *sink.borrow_mut() = Sink::File {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        };
    });
    Ok(())
}

pub fn to_stdout() {
    SINK.with(|sink| *sink.borrow_mut() = Sink::Stdout);
}

pub fn to_stderr() {
    SINK.with(|sink| *sink.borrow_mut() = Sink::Stderr);
}

/// Install the no-op sink for this thread.
pub fn disable() {
    SINK.with(|sink| *sink.borrow_mut() = Sink::Disabled);
}

/// Human-readable description of this thread's sink, for status snapshots.
pub fn describe() -> String {
    SINK.with(|sink| match &*sink.borrow() {
        Sink::Disabled => "disabled".to_string(),
        Sink::Stdout => "stdout".to_string(),
        Sink::Stderr => "stderr".to_string(),
        Sink::File { path, .. } => format!("file {}", path.display()),
    })
}

/// Write one line through this thread's sink. Prefer the `logline!` macro,
/// which fills in the call site.
pub fn write_line(file: &str, line: u32, args: fmt::Arguments<'_>) {
    SINK.with(|sink| {
        let mut sink = sink.borrow_mut();
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let result = match &mut *sink {
            Sink::Disabled => Ok(()),
            Sink::Stdout => {
                let stdout = io::stdout();
                writeln!(stdout.lock(), "[{}] {}:{} {}", timestamp, file, line, args)
            }
            Sink::Stderr => {
                let stderr = io::stderr();
                writeln!(stderr.lock(), "[{}] {}:{} {}", timestamp, file, line, args)
            }
            Sink::File { writer, .. } => {
                writeln!(writer, "[{}] {}:{} {}", timestamp, file, line, args)
                    .and_then(|()| writer.flush())
            }
        };
        // A dead sink must never take the pipeline down with it.
        if result.is_err() {
            *sink = Sink::Disabled;
        }
    });
}

/// Log a line through the current thread's sink.
#[macro_export]
macro_rules! logline {
    ($($arg:tt)*) => {
        $crate::logger::write_line(file!(), line!(), format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_sink_appends_prefixed_lines() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("worker.log");

        to_file(&log_path).unwrap();
        logline!("registered {} watches", 3);
        logline!("stopping normally");
        disable();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("logger.rs"));
        assert!(lines[0].ends_with("registered 3 watches"));
        assert!(lines[1].ends_with("stopping normally"));
    }

    #[test]
    fn test_disable_is_a_no_op_sink() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("quiet.log");

        to_file(&log_path).unwrap();
        disable();
        logline!("should not appear");

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.is_empty());
    }

    #[test]
    fn test_sinks_are_per_thread() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("main.log");
        to_file(&log_path).unwrap();

        // A fresh thread starts disabled regardless of this thread's sink.
        std::thread::spawn(|| {
            assert_eq!(describe(), "disabled");
            logline!("silent");
        })
        .join()
        .unwrap();

        logline!("from the configuring thread");
        disable();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("from the configuring thread"));
        assert!(!contents.contains("silent"));
    }
}
