use std::fs::OpenOptions;
use std::io::{self, Write};

use tracing::info;

use crate::error::TargetError;
use crate::rolling::RollingFile;

/// Where the sink writes its flushed bytes.
pub type SinkWriter = Box<dyn Write + Send>;

type TargetFactory = fn(&str) -> Result<SinkWriter, TargetError>;

const TARGETS: &[(&str, TargetFactory)] = &[
    ("stdout", stdout_target),
    ("file", file_target),
    ("rollingfile", rolling_file_target),
];

fn stdout_target(_args: &str) -> Result<SinkWriter, TargetError> {
    Ok(Box::new(io::stdout()))
}

// filename, or filename:max_size[:max_age[:suffix_format]] for a rolling file
fn file_target(args: &str) -> Result<SinkWriter, TargetError> {
    let invalid = |reason: &str| TargetError::InvalidArgs {
        args: args.to_string(),
        reason: reason.to_string(),
    };

    let mut parts = args.splitn(4, ':');
    let filename = parts.next().unwrap_or_default().trim();
    if filename.is_empty() {
        return Err(invalid("filename is missing"));
    }

    let Some(max_size) = parts.next() else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(filename)?;
        info!(filename, "Writing events to file");
        return Ok(Box::new(file));
    };

    let max_size: u64 = max_size
        .trim()
        .parse()
        .map_err(|_| invalid("max size is not a number"))?;
    let max_age: u64 = match parts.next() {
        Some(max_age) => max_age
            .trim()
            .parse()
            .map_err(|_| invalid("max age is not a number"))?,
        None => 0,
    };
    let suffix_format = parts.next();

    let file = RollingFile::open(filename, max_size, max_age, suffix_format)?;
    info!(
        filename = %file.path().display(),
        max_size, max_age, "Writing events to rolling file"
    );
    Ok(Box::new(file))
}

// Same arguments as `file`, but the size limit is required
fn rolling_file_target(args: &str) -> Result<SinkWriter, TargetError> {
    let has_max_size = args
        .split(':')
        .nth(1)
        .is_some_and(|max_size| !max_size.trim().is_empty());
    if !has_max_size {
        return Err(TargetError::InvalidArgs {
            args: args.to_string(),
            reason: "rolling file needs filename:max_size".to_string(),
        });
    }

    file_target(args)
}

/// Open the target registered under `name`.
pub fn target_by_name(name: &str, args: &str) -> Result<SinkWriter, TargetError> {
    let (_, factory) = TARGETS
        .iter()
        .find(|(registered, _)| *registered == name)
        .ok_or_else(|| TargetError::UnknownTarget(name.to_string()))?;

    factory(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn file_target_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        fs::write(&path, "first\n").unwrap();

        let mut writer = target_by_name("file", path.to_str().unwrap()).unwrap();
        writer.write_all(b"second\n").unwrap();
        writer.flush().unwrap();
        drop(writer);

        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn file_target_with_limits_rolls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let args = format!("{}:8:0:part", path.display());

        let mut writer = target_by_name("file", &args).unwrap();
        writer.write_all(b"aaaaaa\n").unwrap();
        writer.write_all(b"bbbbbb\n").unwrap();
        writer.flush().unwrap();
        drop(writer);

        assert_eq!(fs::read_to_string(&path).unwrap(), "bbbbbb\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("out.log.part")).unwrap(),
            "aaaaaa\n"
        );
    }

    #[test]
    fn rolling_file_target_rolls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let args = format!("{}:8:0:part", path.display());

        let mut writer = target_by_name("rollingfile", &args).unwrap();
        writer.write_all(b"aaaaaa\n").unwrap();
        writer.write_all(b"bbbbbb\n").unwrap();
        writer.flush().unwrap();
        drop(writer);

        assert_eq!(fs::read_to_string(&path).unwrap(), "bbbbbb\n");
        assert!(dir.path().join("out.log.part").exists());

        // A bare filename is refused before anything is opened
        let plain = dir.path().join("plain.log");
        assert!(target_by_name("rollingfile", plain.to_str().unwrap()).is_err());
        assert!(!plain.exists());
    }

    #[test]
    fn bad_arguments_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let path = path.display();

        let test_cases = vec![
            ("file", String::new()),
            ("file", ":100".to_string()),
            ("file", format!("{path}:big")),
            ("file", format!("{path}:100:old")),
            ("rollingfile", String::new()),
            ("rollingfile", path.to_string()),
            ("rollingfile", format!("{path}:")),
        ];

        for (name, args) in test_cases {
            assert!(
                matches!(
                    target_by_name(name, &args),
                    Err(TargetError::InvalidArgs { .. })
                ),
                "args={args}"
            );
        }
    }

    #[test]
    fn unknown_target_is_rejected() {
        assert!(matches!(
            target_by_name("s3", "bucket"),
            Err(TargetError::UnknownTarget(name)) if name == "s3"
        ));
        assert!(target_by_name("stdout", "").is_ok());
    }
}
