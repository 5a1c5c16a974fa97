//! Command-line parsing.

use std::path::PathBuf;

use anyhow::{Context, bail};

pub const USAGE: &str = "\
usage: cloudxfer [--config PATH] [--chunk-size BYTES] <command>

commands:
  upload <file> <bucket> <key>       upload a local file
  download <bucket> <key> <file>     download an object
  resume                             continue unfinished transfers
  list                               show recorded transfers

environment:
  CLOUDXFER_ACCESS_KEY_ID, CLOUDXFER_SECRET_ACCESS_KEY
  RUST_LOG                           log filter (default info,cloudxfer=debug)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Upload {
        file: PathBuf,
        bucket: String,
        key: String,
    },
    Download {
        bucket: String,
        key: String,
        file: PathBuf,
    },
    Resume,
    List,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub config: Option<PathBuf>,
    pub chunk_size: Option<u64>,
    pub command: Command,
}

impl Args {
    pub fn parse<I>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = None;
        let mut chunk_size = None;
        let mut positional = Vec::new();

        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-h" | "--help" => {
                    return Ok(Self {
                        config,
                        chunk_size,
                        command: Command::Help,
                    });
                }
                "--config" => {
                    let value = iter.next().context("--config needs a path")?;
                    config = Some(PathBuf::from(value));
                }
                "--chunk-size" => {
                    let value = iter.next().context("--chunk-size needs a value")?;
                    let bytes = value
                        .parse::<u64>()
                        .with_context(|| format!("invalid chunk size {value:?}"))?;
                    chunk_size = Some(bytes);
                }
                flag if flag.starts_with("--") => bail!("unknown option {flag}"),
                _ => positional.push(arg),
            }
        }

        let command = match positional.as_slice() {
            [] => Command::Help,
            [cmd, file, bucket, key] if cmd == "upload" => Command::Upload {
                file: PathBuf::from(file),
                bucket: bucket.clone(),
                key: key.clone(),
            },
            [cmd, bucket, key, file] if cmd == "download" => Command::Download {
                bucket: bucket.clone(),
                key: key.clone(),
                file: PathBuf::from(file),
            },
            [cmd] if cmd == "resume" => Command::Resume,
            [cmd] if cmd == "list" => Command::List,
            [cmd, ..] => bail!("invalid arguments for {cmd:?}\n\n{USAGE}"),
        };

        Ok(Self {
            config,
            chunk_size,
            command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Args> {
        Args::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn upload_with_options() {
        let args = parse(&[
            "--config",
            "/etc/x.json",
            "upload",
            "a.bin",
            "bucket",
            "dir/a.bin",
            "--chunk-size",
            "16777216",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/x.json")));
        assert_eq!(args.chunk_size, Some(16 * 1024 * 1024));
        assert_eq!(
            args.command,
            Command::Upload {
                file: PathBuf::from("a.bin"),
                bucket: "bucket".into(),
                key: "dir/a.bin".into(),
            }
        );
    }

    #[test]
    fn download_and_simple_commands() {
        assert!(matches!(
            parse(&["download", "b", "k", "out.bin"]).unwrap().command,
            Command::Download { .. }
        ));
        assert_eq!(parse(&["resume"]).unwrap().command, Command::Resume);
        assert_eq!(parse(&["list"]).unwrap().command, Command::List);
        assert_eq!(parse(&[]).unwrap().command, Command::Help);
        assert_eq!(parse(&["-h"]).unwrap().command, Command::Help);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&["upload", "a.bin"]).is_err());
        assert!(parse(&["--chunk-size", "lots", "resume"]).is_err());
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["--verbose", "list"]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
    }
}
