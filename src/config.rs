use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use zerocopy::FromBytes;

use crate::region::MmapRegion;
use crate::state::dir::{Comparator, DirEntry};
use crate::state::host::{HostEntry, ProtocolFamily};
use crate::state::job::JobRecord;

/// Queue capacity of the job status region.
pub const JSA_SLOTS: u32 = 256;

pub fn hsa_path(work_dir: &Path) -> PathBuf {
    work_dir.join("region").join("hsa.region")
}

pub fn dsa_path(work_dir: &Path) -> PathBuf {
    work_dir.join("region").join("dsa.region")
}

pub fn jsa_path(work_dir: &Path) -> PathBuf {
    work_dir.join("region").join("jsa.region")
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub work_dir: PathBuf,
    /// 归档根目录；缺省为 <work_dir>/archive — archive root, defaulting under
    /// the work dir.
    #[serde(default)]
    pub archive_root: Option<PathBuf>,
    #[serde(default = "default_retry_base")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_secs: u64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_history_rotate")]
    pub error_history_rotate_secs: u64,
    pub version: Option<u32>,
}

fn default_retry_base() -> u64 {
    10
}
fn default_retry_max() -> u64 {
    3600
}
fn default_scan_interval() -> u64 {
    60
}
fn default_history_rotate() -> u64 {
    600
}

impl Config {
    fn default_work_dir() -> PathBuf {
        match dirs::home_dir() {
            Some(home) => home.join(".spoolpilot"),
            None => PathBuf::from(".spoolpilot"),
        }
    }

    /// Load `<work_dir>/etc/config.json`, writing the defaults on first run.
    pub fn init(work_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let work_dir = work_dir.unwrap_or_else(Self::default_work_dir);
        let etc = work_dir.join("etc");
        std::fs::create_dir_all(&etc)
            .with_context(|| format!("无法准备配置目录: {}", etc.display()))?;
        let config_path = etc.join("config.json");
        if !config_path.exists() {
            let cfg = Config {
                work_dir: work_dir.clone(),
                archive_root: None,
                retry_base_secs: default_retry_base(),
                retry_max_secs: default_retry_max(),
                scan_interval_secs: default_scan_interval(),
                error_history_rotate_secs: default_history_rotate(),
                version: Some(1),
            };
            cfg.save_to(&config_path)?;
            return Ok(cfg);
        }
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("读取配置失败: {}", config_path.display()))?;
        let mut cfg: Config = serde_json::from_str(&raw)
            .with_context(|| format!("解析配置失败: {}", config_path.display()))?;
        // the directory we found the file in is authoritative
        cfg.work_dir = work_dir;
        Ok(cfg)
    }

    fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("写入配置失败: {}", path.display()))?;
        Ok(())
    }

    pub fn save_to_storage(&self) -> anyhow::Result<()> {
        self.save_to(&self.work_dir.join("etc").join("config.json"))
    }

    pub fn archive_root(&self) -> PathBuf {
        self.archive_root.clone().unwrap_or_else(|| self.work_dir.join("archive"))
    }

    pub fn load_host_seeds(&self) -> anyhow::Result<Vec<HostSeed>> {
        let path = self.work_dir.join("etc").join("hosts.json");
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("读取主机表失败: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("解析主机表失败: {}", path.display()))
    }

    pub fn load_dir_seeds(&self) -> anyhow::Result<Vec<DirSeed>> {
        let path = self.work_dir.join("etc").join("dirs.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("读取目录表失败: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("解析目录表失败: {}", path.display()))
    }
}

fn parse_protocol(s: &str) -> ProtocolFamily {
    match s.to_ascii_lowercase().as_str() {
        "ftp" => ProtocolFamily::Ftp,
        "ftps" => ProtocolFamily::Ftps,
        "sftp" => ProtocolFamily::Sftp,
        "scp" => ProtocolFamily::Scp,
        "http" => ProtocolFamily::Http,
        "https" => ProtocolFamily::Https,
        "smtp" | "mailto" => ProtocolFamily::Smtp,
        "wmo" => ProtocolFamily::Wmo,
        "exec" => ProtocolFamily::Exec,
        "dfax" => ProtocolFamily::Dfax,
        other => {
            tracing::warn!("[cfg] 未知协议 '{}'，按 ftp 处理", other);
            ProtocolFamily::Ftp
        }
    }
}

fn comparator_from(s: &Option<String>) -> Comparator {
    match s.as_deref() {
        Some("==") => Comparator::Equal,
        Some("<") => Comparator::Less,
        Some(">") => Comparator::Greater,
        _ => Comparator::Off,
    }
}

/// One destination host as configured in `etc/hosts.json`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HostSeed {
    pub alias: String,
    pub hostname: String,
    #[serde(default)]
    pub hostname_toggle: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    pub protocol: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub target_dir: String,
    #[serde(default = "default_allowed")]
    pub allowed_transfers: u32,
    #[serde(default = "default_block")]
    pub block_size: u32,
    #[serde(default = "default_timeout")]
    pub transfer_timeout: u32,
    #[serde(default)]
    pub rate_limit: u32,
    #[serde(default)]
    pub keep_connected: u32,
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    #[serde(default)]
    pub options: u32,
    /// Archive retention in seconds; 0 unlinks delivered files instead.
    #[serde(default)]
    pub archive_secs: u64,
    /// Duplicate-check key bits (see `DupFlags`); 0 disables the check.
    #[serde(default)]
    pub dup_flags: u8,
    #[serde(default)]
    pub dup_timeout: u64,
}

fn default_port() -> u16 {
    21
}
fn default_allowed() -> u32 {
    2
}
fn default_block() -> u32 {
    4096
}
fn default_timeout() -> u32 {
    120
}
fn default_max_errors() -> u32 {
    10
}

impl HostSeed {
    pub fn apply_to(&self, e: &mut HostEntry) {
        e.set_alias(&self.alias);
        e.set_hostname(0, &self.hostname);
        e.set_hostname(1, self.hostname_toggle.as_deref().unwrap_or(&self.hostname));
        e.port = self.port;
        e.protocol = parse_protocol(&self.protocol).into();
        e.allowed_transfers = self.allowed_transfers.min(crate::state::host::MAX_JOB_SLOTS as u32);
        e.block_size = self.block_size;
        e.transfer_timeout = self.transfer_timeout;
        e.rate_limit = self.rate_limit;
        e.keep_connected = self.keep_connected;
        e.max_errors = self.max_errors;
        e.proto_options = self.options;
    }
}

/// One monitored source directory as configured in `etc/dirs.json`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DirSeed {
    pub alias: String,
    pub url: String,
    pub host_alias: String,
    /// Mask groups, outer list first-match-wins, '!' negates.
    #[serde(default)]
    pub mask_groups: Vec<Vec<String>>,
    #[serde(default)]
    pub scan_flags: u32,
    #[serde(default)]
    pub delete_flags: u32,
    #[serde(default)]
    pub ignore_size: Option<i64>,
    #[serde(default)]
    pub ignore_size_cond: Option<String>,
    #[serde(default)]
    pub ignore_file_time: Option<i64>,
    #[serde(default)]
    pub ignore_time_cond: Option<String>,
    #[serde(default)]
    pub unknown_file_time: i64,
    #[serde(default)]
    pub locked_file_time: i64,
    #[serde(default)]
    pub max_copied_files: u32,
    #[serde(default)]
    pub max_copied_file_size: u64,
}

impl DirSeed {
    pub fn apply_to(&self, e: &mut DirEntry, dir_id: u32, host_index: u32) {
        e.dir_id = dir_id;
        e.set_alias(&self.alias);
        e.set_url(&self.url);
        e.host_index = host_index;
        e.scan_flags = self.scan_flags;
        e.delete_flags = self.delete_flags;
        e.ignore_size = self.ignore_size.unwrap_or(-1);
        e.ignore_size_cond = comparator_from(&self.ignore_size_cond).into();
        e.ignore_file_time = self.ignore_file_time.unwrap_or(-1);
        e.ignore_time_cond = comparator_from(&self.ignore_time_cond).into();
        e.unknown_file_time = self.unknown_file_time;
        e.locked_file_time = self.locked_file_time;
        e.max_copied_files = self.max_copied_files;
        e.max_copied_file_size = self.max_copied_file_size;
    }

    pub fn mask_groups(&self) -> Vec<crate::scan::MaskGroup> {
        if self.mask_groups.is_empty() {
            return vec![crate::scan::MaskGroup::from_strings(&["*"])];
        }
        self.mask_groups.iter().map(|g| crate::scan::MaskGroup::from_strings(g)).collect()
    }
}

fn zeroed<T: crate::region::Record>() -> T {
    T::read_from_bytes(&vec![0u8; std::mem::size_of::<T>()][..]).expect("zeroed record")
}

/// Create the three shared regions from the seed tables. Done once by
/// `spd init` (or a privileged resize later); the daemon and its workers
/// only attach.
pub fn bootstrap_regions(cfg: &Config) -> anyhow::Result<(usize, usize)> {
    let hosts = cfg.load_host_seeds()?;
    let dirs = cfg.load_dir_seeds()?;
    let mut hsa = MmapRegion::<HostEntry>::create(hsa_path(&cfg.work_dir), hosts.len() as u32)?;
    for (i, seed) in hosts.iter().enumerate() {
        let mut e: HostEntry = zeroed();
        seed.apply_to(&mut e);
        *hsa.entry_mut(i) = e;
    }
    hsa.flush()?;

    let mut dsa = MmapRegion::<DirEntry>::create(dsa_path(&cfg.work_dir), dirs.len() as u32)?;
    for (i, seed) in dirs.iter().enumerate() {
        let host_index = hosts
            .iter()
            .position(|h| h.alias == seed.host_alias)
            .ok_or_else(|| anyhow::anyhow!("目录 '{}' 引用未知主机 '{}'", seed.alias, seed.host_alias))?;
        let mut e: DirEntry = zeroed();
        seed.apply_to(&mut e, i as u32, host_index as u32);
        *dsa.entry_mut(i) = e;
    }
    dsa.flush()?;

    let jsa = MmapRegion::<JobRecord>::create(jsa_path(&cfg.work_dir), JSA_SLOTS)?;
    jsa.flush()?;
    Ok((hosts.len(), dirs.len()))
}
