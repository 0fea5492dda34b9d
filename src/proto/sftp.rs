use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::{CodecError, CodecErrorKind, DialTarget, ListingEntry, RemoteLike};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// SFTP/SCP 编解码器 — thin adapter over ssh2. One session per worker, one
/// open file per direction, TCP timeouts derived from the job deadline.
pub struct Ssh2Codec {
    sess: Option<ssh2::Session>,
    sftp: Option<ssh2::Sftp>,
    base: PathBuf,
    wfile: Option<ssh2::File>,
    rfile: Option<ssh2::File>,
}

impl Ssh2Codec {
    pub fn new() -> Self {
        Self { sess: None, sftp: None, base: PathBuf::new(), wfile: None, rfile: None }
    }

    /// SSH 密钥认证的通用逻辑 — try the usual key files, then password.
    fn authenticate(sess: &mut ssh2::Session, target: &DialTarget) -> bool {
        if sess.authenticated() {
            return true;
        }
        if let Some(home_p) = dirs::home_dir() {
            for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
                let p = home_p.join(".ssh").join(name);
                if p.exists() {
                    let _ = sess.userauth_pubkey_file(&target.user, None, &p, None);
                    if sess.authenticated() {
                        return true;
                    }
                }
            }
        }
        if let Some(ref pw) = target.password {
            let _ = sess.userauth_password(&target.user, pw);
        }
        sess.authenticated()
    }

    fn remaining_ms(deadline: Instant) -> u32 {
        deadline.saturating_duration_since(Instant::now()).as_millis().min(u32::MAX as u128) as u32
    }

    fn sftp(&self) -> Result<&ssh2::Sftp, CodecError> {
        self.sftp
            .as_ref()
            .ok_or_else(|| CodecError::new(CodecErrorKind::Connect, "sftp session not established"))
    }

    fn remote_path(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }
}

impl Default for Ssh2Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteLike for Ssh2Codec {
    fn dial(&mut self, target: &DialTarget, deadline: Instant) -> Result<(), CodecError> {
        let addr = format!("{}:{}", target.hostname, target.port);
        let mut addrs = addr
            .to_socket_addrs()
            .map_err(|e| CodecError::new(CodecErrorKind::Connect, format!("{}: {}", addr, e)))?;
        let sock = addrs
            .next()
            .ok_or_else(|| CodecError::new(CodecErrorKind::Connect, format!("无法解析地址: {}", addr)))?;
        let tcp = TcpStream::connect_timeout(&sock, CONNECT_TIMEOUT)
            .map_err(|e| CodecError::eval_timeout(CodecErrorKind::Connect, e.to_string(), deadline))?;
        let io_timeout = Duration::from_millis(Self::remaining_ms(deadline) as u64);
        let _ = tcp.set_read_timeout(Some(io_timeout));
        let _ = tcp.set_write_timeout(Some(io_timeout));

        let mut sess = ssh2::Session::new().map_err(|_| {
            CodecError::new(CodecErrorKind::Connect, format!("无法创建 SSH Session: {}", addr))
        })?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout(Self::remaining_ms(deadline));
        sess.handshake().map_err(|e| {
            CodecError::eval_timeout(CodecErrorKind::Connect, format!("SSH 握手失败: {}", e), deadline)
        })?;
        if !Self::authenticate(&mut sess, target) {
            return Err(CodecError::new(
                CodecErrorKind::Connect,
                format!("SSH 认证失败: {}", addr),
            ));
        }
        let sftp = sess
            .sftp()
            .map_err(|e| CodecError::new(CodecErrorKind::Connect, format!("SFTP 创建失败: {}", e)))?;
        self.base = PathBuf::from(&target.base);
        self.sess = Some(sess);
        self.sftp = Some(sftp);
        Ok(())
    }

    fn open_write(&mut self, name: &str, _size: u64, deadline: Instant) -> Result<(), CodecError> {
        if let Some(s) = self.sess.as_ref() {
            s.set_timeout(Self::remaining_ms(deadline));
        }
        let path = self.remote_path(name);
        let f = self.sftp()?.create(&path).map_err(|e| {
            CodecError::eval_timeout(
                CodecErrorKind::OpenRemote,
                format!("远端创建文件失败: {} — {}", path.display(), e),
                deadline,
            )
        })?;
        self.wfile = Some(f);
        Ok(())
    }

    fn write_chunk(&mut self, data: &[u8], deadline: Instant) -> Result<(), CodecError> {
        if let Some(s) = self.sess.as_ref() {
            s.set_timeout(Self::remaining_ms(deadline));
        }
        let f = self
            .wfile
            .as_mut()
            .ok_or_else(|| CodecError::new(CodecErrorKind::WriteRemote, "no open remote file"))?;
        f.write_all(data).map_err(|e| {
            CodecError::eval_timeout(
                CodecErrorKind::WriteRemote,
                format!("远端写入失败: {}", e),
                deadline,
            )
        })
    }

    fn close_file(&mut self, deadline: Instant) -> Result<(), CodecError> {
        if let Some(s) = self.sess.as_ref() {
            s.set_timeout(Self::remaining_ms(deadline));
        }
        if let Some(mut f) = self.wfile.take() {
            f.close().map_err(|e| {
                CodecError::eval_timeout(
                    CodecErrorKind::CloseRemote,
                    format!("远端关闭失败: {}", e),
                    deadline,
                )
            })?;
        }
        self.rfile = None;
        Ok(())
    }

    fn list(&mut self, deadline: Instant) -> Result<Vec<ListingEntry>, CodecError> {
        if let Some(s) = self.sess.as_ref() {
            s.set_timeout(Self::remaining_ms(deadline));
        }
        let base = self.base.clone();
        let entries = self.sftp()?.readdir(&base).map_err(|e| {
            CodecError::eval_timeout(
                CodecErrorKind::List,
                format!("远端列目录失败: {} — {}", base.display(), e),
                deadline,
            )
        })?;
        let mut out = Vec::with_capacity(entries.len());
        for (path, st) in entries {
            if st.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            // SFTP stat carries exact sizes and second-precision mtimes.
            out.push(ListingEntry {
                name,
                size: st.size.map(|s| s as i64),
                mtime: st.mtime.map(|m| m as i64),
                exact_size: st.size.is_some(),
                exact_date: st.mtime.is_some(),
                extra: None,
            });
        }
        Ok(out)
    }

    fn head(
        &mut self,
        name: &str,
        deadline: Instant,
    ) -> Result<(Option<i64>, Option<i64>), CodecError> {
        if let Some(s) = self.sess.as_ref() {
            s.set_timeout(Self::remaining_ms(deadline));
        }
        let path = self.remote_path(name);
        let st = self.sftp()?.stat(&path).map_err(|e| {
            CodecError::eval_timeout(
                CodecErrorKind::Date,
                format!("远端 stat 失败: {} — {}", path.display(), e),
                deadline,
            )
        })?;
        Ok((st.size.map(|s| s as i64), st.mtime.map(|m| m as i64)))
    }

    fn open_read(&mut self, name: &str, deadline: Instant) -> Result<(), CodecError> {
        if let Some(s) = self.sess.as_ref() {
            s.set_timeout(Self::remaining_ms(deadline));
        }
        let path = self.remote_path(name);
        let f = self.sftp()?.open(&path).map_err(|e| {
            CodecError::eval_timeout(
                CodecErrorKind::OpenRemote,
                format!("远端打开失败: {} — {}", path.display(), e),
                deadline,
            )
        })?;
        self.rfile = Some(f);
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize, CodecError> {
        if let Some(s) = self.sess.as_ref() {
            s.set_timeout(Self::remaining_ms(deadline));
        }
        let f = self
            .rfile
            .as_mut()
            .ok_or_else(|| CodecError::new(CodecErrorKind::ReadRemote, "no open remote file"))?;
        f.read(buf).map_err(|e| {
            CodecError::eval_timeout(
                CodecErrorKind::ReadRemote,
                format!("远端读取失败: {}", e),
                deadline,
            )
        })
    }

    fn delete(&mut self, name: &str, deadline: Instant) -> Result<(), CodecError> {
        if let Some(s) = self.sess.as_ref() {
            s.set_timeout(Self::remaining_ms(deadline));
        }
        let path = self.remote_path(name);
        self.sftp()?.unlink(Path::new(&path)).map_err(|e| {
            CodecError::eval_timeout(
                CodecErrorKind::WriteRemote,
                format!("远端删除失败: {} — {}", path.display(), e),
                deadline,
            )
        })
    }

    fn quit(&mut self) {
        self.wfile = None;
        self.rfile = None;
        self.sftp = None;
        if let Some(sess) = self.sess.take() {
            let _ = sess.disconnect(None, "bye", None);
        }
    }
}
