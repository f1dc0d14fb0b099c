//! Follows a process log file and publishes each line on its log topic.

use std::{path::Path, time::Duration};

use kestrel_process::Identity;
use tokio::io::AsyncReadExt;

use crate::{process_manager::ProcessManager, pubsub::Topic};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    ino: u64,
}

impl FileStamp {
    fn of(meta: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Self { ino: meta.ino() }
        }
        #[cfg(not(unix))]
        {
            let _ = meta;
            Self { ino: 0 }
        }
    }
}

async fn open(path: &Path) -> std::io::Result<(tokio::fs::File, FileStamp)> {
    let file = tokio::fs::File::open(path).await?;
    let stamp = FileStamp::of(&file.metadata().await?);
    Ok((file, stamp))
}

/// Whether the file at `path` is no longer the one being read: it was
/// removed, replaced, or truncated below the read position.
async fn replaced(path: &Path, stamp: FileStamp, pos: u64) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len() < pos || FileStamp::of(&meta) != stamp,
        Err(_) => true,
    }
}

/// Splits complete lines off the front of `pending`.
fn drain_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(nl) = pending.iter().position(|b| *b == b'\n') {
        let mut line = pending.drain(..=nl).collect::<Vec<u8>>();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).into_owned());
    }
    lines
}

/// Publishes every line of the log for `id` from the start of the file,
/// then keeps following it. Returns, closing `topic`, once the topic was
/// closed elsewhere or the process is gone and the file fully read.
pub(crate) async fn follow(manager: &ProcessManager, id: &Identity, topic: &Topic<String>, poll: Duration) {
    let path = manager.log_path(id);
    let mut file: Option<(tokio::fs::File, FileStamp)> = None;
    let mut pos = 0u64;
    let mut pending = Vec::<u8>::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut draining = false;

    loop {
        if topic.is_closed() {
            break;
        }

        if file.is_none() {
            match open(&path).await {
                Ok(opened) => {
                    file = Some(opened);
                    pos = 0;
                    pending.clear();
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if !manager.is_alive(id).await {
                        break;
                    }
                    tokio::time::sleep(poll).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(process_id = %id, path = %path.display(), error = %e, "cannot open log file");
                    break;
                }
            }
        }
        let Some((reader, stamp)) = file.as_mut() else {
            continue;
        };
        let stamp = *stamp;

        match reader.read(&mut buf).await {
            Ok(0) => {}
            Ok(n) => {
                pos += n as u64;
                pending.extend_from_slice(&buf[..n]);
                for line in drain_lines(&mut pending) {
                    topic.publish(line).await;
                }
                continue;
            }
            Err(e) => {
                tracing::warn!(process_id = %id, error = %e, "log read failed");
                break;
            }
        }

        if replaced(&path, stamp, pos).await {
            tracing::debug!(process_id = %id, "log file replaced, reopening");
            file = None;
            continue;
        }
        if draining {
            if !pending.is_empty() {
                let rest = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                topic.publish(rest).await;
            }
            break;
        }
        if !manager.is_alive(id).await {
            // One more pass picks up anything written right before exit.
            draining = true;
            continue;
        }
        tokio::time::sleep(poll).await;
    }

    topic.close();
    tracing::debug!(process_id = %id, "log tail stopped");
}
