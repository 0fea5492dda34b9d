use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Instant;

use super::{CodecError, CodecErrorKind, DialTarget, ListingEntry, RemoteLike};

/// Environment exported to user exec commands.
pub const ENV_TIMEOUT: &str = "AFD_HC_TIMEOUT";
pub const ENV_BLOCKSIZE: &str = "AFD_HC_BLOCKSIZE";
pub const ENV_HOSTNAME: &str = "AFD_CURRENT_HOSTNAME";

/// 本地执行编解码器 — the local-execution protocol family, and at the same
/// time the loopback destination used by the integration runs: "remote" is a
/// directory on this machine.
///
/// Files land via a hidden `.part` staging name and an atomic rename, so a
/// crashed worker never leaves a half-delivered file under its final name.
pub struct LocalCodec {
    exec_mode: bool,
    base: PathBuf,
    command: Option<String>,
    env: Vec<(String, String)>,
    wfile: Option<(PathBuf, PathBuf, File)>,
    rfile: Option<File>,
}

impl LocalCodec {
    pub fn new() -> Self {
        Self {
            exec_mode: false,
            base: PathBuf::new(),
            command: None,
            env: Vec::new(),
            wfile: None,
            rfile: None,
        }
    }

    /// Exec family: each delivered file is handed to the configured command.
    pub fn exec() -> Self {
        let mut c = Self::new();
        c.exec_mode = true;
        c
    }
}

impl Default for LocalCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn io_err(kind: CodecErrorKind, ctx: &str, e: std::io::Error, deadline: Instant) -> CodecError {
    CodecError::eval_timeout(kind, format!("{}: {}", ctx, e), deadline)
}

impl RemoteLike for LocalCodec {
    fn dial(&mut self, target: &DialTarget, deadline: Instant) -> Result<(), CodecError> {
        self.base = PathBuf::from(&target.base);
        std::fs::create_dir_all(&self.base)
            .map_err(|e| io_err(CodecErrorKind::Connect, "目标目录不可用", e, deadline))?;
        if self.exec_mode {
            // exec family carries the command line in the hostname field
            self.command = Some(target.hostname.clone());
        }
        self.env = vec![
            (ENV_TIMEOUT.to_string(), target.timeout_secs.to_string()),
            (ENV_BLOCKSIZE.to_string(), target.block_size.to_string()),
            (ENV_HOSTNAME.to_string(), target.hostname.clone()),
        ];
        Ok(())
    }

    fn open_write(&mut self, name: &str, _size: u64, deadline: Instant) -> Result<(), CodecError> {
        let final_path = self.base.join(name);
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| io_err(CodecErrorKind::OpenRemote, "创建目标子目录失败", e, deadline))?;
        }
        let part = self.base.join(format!(".{}.part", name.replace('/', "_")));
        let f = File::create(&part)
            .map_err(|e| io_err(CodecErrorKind::OpenRemote, "创建暂存文件失败", e, deadline))?;
        self.wfile = Some((part, final_path, f));
        Ok(())
    }

    fn write_chunk(&mut self, data: &[u8], deadline: Instant) -> Result<(), CodecError> {
        let (_, _, f) = self
            .wfile
            .as_mut()
            .ok_or_else(|| CodecError::new(CodecErrorKind::WriteRemote, "no open file"))?;
        f.write_all(data)
            .map_err(|e| io_err(CodecErrorKind::WriteRemote, "写入暂存文件失败", e, deadline))
    }

    fn close_file(&mut self, deadline: Instant) -> Result<(), CodecError> {
        self.rfile = None;
        let Some((part, final_path, f)) = self.wfile.take() else {
            return Ok(());
        };
        f.sync_all()
            .map_err(|e| io_err(CodecErrorKind::CloseRemote, "fsync 失败", e, deadline))?;
        drop(f);
        std::fs::rename(&part, &final_path)
            .map_err(|e| io_err(CodecErrorKind::CloseRemote, "重命名落盘失败", e, deadline))?;
        if self.exec_mode
            && let Some(cmd) = self.command.clone()
        {
            let status = std::process::Command::new("sh")
                .arg("-c")
                .arg(format!("{} '{}'", cmd, final_path.display()))
                .envs(self.env.iter().cloned())
                .status()
                .map_err(|e| CodecError::new(CodecErrorKind::Exec, e.to_string()))?;
            if !status.success() {
                return Err(CodecError::new(
                    CodecErrorKind::Exec,
                    format!("命令退出码 {:?}: {}", status.code(), cmd),
                ));
            }
        }
        Ok(())
    }

    fn list(&mut self, deadline: Instant) -> Result<Vec<ListingEntry>, CodecError> {
        let rd = std::fs::read_dir(&self.base)
            .map_err(|e| io_err(CodecErrorKind::List, "列目录失败", e, deadline))?;
        let mut out = Vec::new();
        for ent in rd.flatten() {
            let Ok(meta) = ent.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64);
            out.push(ListingEntry {
                name: ent.file_name().to_string_lossy().to_string(),
                size: Some(meta.len() as i64),
                mtime,
                exact_size: true,
                exact_date: mtime.is_some(),
                extra: None,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn head(
        &mut self,
        name: &str,
        deadline: Instant,
    ) -> Result<(Option<i64>, Option<i64>), CodecError> {
        let meta = std::fs::metadata(self.base.join(name))
            .map_err(|e| io_err(CodecErrorKind::Date, "stat 失败", e, deadline))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);
        Ok((Some(meta.len() as i64), mtime))
    }

    fn open_read(&mut self, name: &str, deadline: Instant) -> Result<(), CodecError> {
        let f = File::open(self.base.join(name))
            .map_err(|e| io_err(CodecErrorKind::OpenRemote, "打开源文件失败", e, deadline))?;
        self.rfile = Some(f);
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize, CodecError> {
        let f = self
            .rfile
            .as_mut()
            .ok_or_else(|| CodecError::new(CodecErrorKind::ReadRemote, "no open file"))?;
        f.read(buf).map_err(|e| io_err(CodecErrorKind::ReadRemote, "读取失败", e, deadline))
    }

    fn delete(&mut self, name: &str, deadline: Instant) -> Result<(), CodecError> {
        std::fs::remove_file(self.base.join(name))
            .map_err(|e| io_err(CodecErrorKind::WriteRemote, "删除失败", e, deadline))
    }

    fn quit(&mut self) {
        self.wfile = None;
        self.rfile = None;
    }
}
