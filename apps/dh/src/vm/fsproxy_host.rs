//! Host file server (§4.2.1): a vsock-forwarded UDS accepting guest
//! connections, serving STAT/READ/READDIR over a binary length-prefixed
//! protocol, rooted at the CWD the exec request was issued from.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use dh_types::DhError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

const OP_STAT: u8 = 0x01;
const OP_READ: u8 = 0x02;
const OP_READDIR: u8 = 0x03;

const RESP_OK: u8 = 0x00;
const RESP_NOT_FOUND: u8 = 0x01;
const RESP_IO_ERROR: u8 = 0x02;

/// Binds `sock_path`, serving requests rooted at `root` until the returned
/// handle is dropped / aborted. One task per connection; the guest
/// typically holds a single long-lived connection.
pub struct FsProxyServer {
    handle: tokio::task::JoinHandle<()>,
}

impl FsProxyServer {
    pub async fn bind(sock_path: &Path, root: PathBuf) -> Result<Self, DhError> {
        if sock_path.exists() {
            let _ = tokio::fs::remove_file(sock_path).await;
        }
        if let Some(parent) = sock_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DhError::permission_denied(e.to_string()))?;
        }
        let listener = UnixListener::bind(sock_path)
            .map_err(|e| DhError::permission_denied(format!("bind {}: {e}", sock_path.display())))?;

        let root = root
            .canonicalize()
            .map_err(|e| DhError::permission_denied(format!("cwd root: {e}")))?;

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let root = root.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, &root).await {
                                tracing::debug!(error = %e, "fsproxy connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "fsproxy accept failed");
                        break;
                    }
                }
            }
        });

        Ok(Self { handle })
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn serve_connection(mut stream: UnixStream, root: &Path) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        let response = handle_request(&payload, root);
        let mut frame = (response.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&response);
        stream.write_all(&frame).await?;
    }
}

fn handle_request(payload: &[u8], root: &Path) -> Vec<u8> {
    if payload.is_empty() {
        return vec![RESP_IO_ERROR];
    }
    match payload[0] {
        OP_STAT => handle_stat(&payload[1..], root),
        OP_READ => handle_read(&payload[1..], root),
        OP_READDIR => handle_readdir(&payload[1..], root),
        _ => vec![RESP_IO_ERROR],
    }
}

/// Cleans the incoming path and rejects anything whose canonicalized
/// absolute form is not a prefix-child of `root` (Testable Property 10).
fn resolve_safe_path(raw: &str, root: &Path) -> Option<PathBuf> {
    let candidate = root.join(raw.trim_start_matches('/'));
    let cleaned = clean_path(&candidate);
    let canonical = cleaned.canonicalize().ok()?;
    if canonical.starts_with(root) {
        Some(canonical)
    } else {
        None
    }
}

/// Lexically removes `.`/`..` components without touching the filesystem,
/// so a non-existent path can still be validated (`canonicalize` above is
/// the filesystem-touching safety check that actually matters).
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn read_path_field(buf: &[u8]) -> Option<(&str, &[u8])> {
    if buf.len() < 2 {
        return None;
    }
    let path_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let rest = &buf[2..];
    if rest.len() < path_len {
        return None;
    }
    let path = std::str::from_utf8(&rest[..path_len]).ok()?;
    Some((path, &rest[path_len..]))
}

fn handle_stat(buf: &[u8], root: &Path) -> Vec<u8> {
    let Some((path, _)) = read_path_field(buf) else {
        return vec![RESP_IO_ERROR];
    };
    let Some(resolved) = resolve_safe_path(path, root) else {
        return vec![RESP_NOT_FOUND];
    };
    match std::fs::metadata(&resolved) {
        Ok(meta) => {
            let mode = file_mode(&meta);
            let size = meta.len();
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let is_dir = meta.is_dir() as u8;

            let mut out = vec![RESP_OK];
            out.extend_from_slice(&mode.to_be_bytes());
            out.extend_from_slice(&size.to_be_bytes());
            out.extend_from_slice(&mtime.to_be_bytes());
            out.push(is_dir);
            out
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![RESP_NOT_FOUND],
        Err(_) => vec![RESP_IO_ERROR],
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

fn handle_read(buf: &[u8], root: &Path) -> Vec<u8> {
    let Some((path, rest)) = read_path_field(buf) else {
        return vec![RESP_IO_ERROR];
    };
    if rest.len() < 12 {
        return vec![RESP_IO_ERROR];
    }
    let offset = u64::from_be_bytes(rest[0..8].try_into().unwrap());
    let length = u32::from_be_bytes(rest[8..12].try_into().unwrap()) as usize;

    let Some(resolved) = resolve_safe_path(path, root) else {
        return vec![RESP_NOT_FOUND];
    };

    use std::io::{Read, Seek, SeekFrom};
    let file = std::fs::File::open(&resolved);
    let mut file = match file {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return vec![RESP_NOT_FOUND],
        Err(_) => return vec![RESP_IO_ERROR],
    };
    if file.seek(SeekFrom::Start(offset)).is_err() {
        return vec![RESP_IO_ERROR];
    }
    let mut data = vec![0u8; length];
    let n = match file.read(&mut data) {
        Ok(n) => n,
        Err(_) => return vec![RESP_IO_ERROR],
    };
    data.truncate(n);

    let mut out = vec![RESP_OK];
    out.extend_from_slice(&(n as u32).to_be_bytes());
    out.extend_from_slice(&data);
    out
}

fn handle_readdir(buf: &[u8], root: &Path) -> Vec<u8> {
    let Some((path, _)) = read_path_field(buf) else {
        return vec![RESP_IO_ERROR];
    };
    let Some(resolved) = resolve_safe_path(path, root) else {
        return vec![RESP_NOT_FOUND];
    };

    let entries = match std::fs::read_dir(&resolved) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return vec![RESP_NOT_FOUND],
        Err(_) => return vec![RESP_IO_ERROR],
    };

    let mut names = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        names.push((name, is_dir));
    }

    let mut out = vec![RESP_OK];
    out.extend_from_slice(&(names.len() as u16).to_be_bytes());
    for (name, is_dir) in names {
        let bytes = name.as_bytes();
        out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(bytes);
        out.push(is_dir as u8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_escaping_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        assert!(resolve_safe_path("../../etc/passwd", &root).is_none());
        assert!(resolve_safe_path("sub/../../outside", &root).is_none());
    }

    #[test]
    fn accepts_path_under_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        std::fs::write(root.join("sample.csv"), b"a,b\n1,2\n").unwrap();
        let resolved = resolve_safe_path("sample.csv", &root).unwrap();
        assert_eq!(resolved, root.join("sample.csv"));
    }

    #[test]
    fn stat_missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let mut req = vec![];
        let path = "missing.txt";
        req.extend_from_slice(&(path.len() as u16).to_be_bytes());
        req.extend_from_slice(path.as_bytes());
        let resp = handle_stat(&req, &root);
        assert_eq!(resp[0], RESP_NOT_FOUND);
    }

    #[test]
    fn read_roundtrips_file_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        std::fs::write(root.join("f.txt"), b"hello world").unwrap();

        let mut req = vec![];
        let path = "f.txt";
        req.extend_from_slice(&(path.len() as u16).to_be_bytes());
        req.extend_from_slice(path.as_bytes());
        req.extend_from_slice(&0u64.to_be_bytes());
        req.extend_from_slice(&5u32.to_be_bytes());

        let resp = handle_read(&req, &root);
        assert_eq!(resp[0], RESP_OK);
        let n = u32::from_be_bytes(resp[1..5].try_into().unwrap());
        assert_eq!(n, 5);
        assert_eq!(&resp[5..10], b"hello");
    }
}
