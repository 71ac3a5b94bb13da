use std::path::PathBuf;

pub const ENV_TRACE: &str = "YAKVM_TRACE";
pub const ENV_CACHE_DIR: &str = "YAKVM_CACHE_DIR";
pub const ENV_MIN_CACHE_LEN: &str = "YAKVM_MIN_CACHE_LEN";

/// Sources shorter than this recompile faster than they hash and load.
pub const DEFAULT_MIN_CACHE_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Print every instruction before it executes.
    pub trace: bool,
    /// Directory mirroring the in-memory bytecode cache. `None` keeps the
    /// cache in memory only.
    pub cache_dir: Option<PathBuf>,
    pub min_cache_len: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig { trace: false, cache_dir: None, min_cache_len: DEFAULT_MIN_CACHE_LEN }
    }
}

impl VmConfig {
    /// Reads `YAKVM_TRACE`, `YAKVM_CACHE_DIR` and `YAKVM_MIN_CACHE_LEN`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = VmConfig::default();
        if let Some(v) = lookup(ENV_TRACE) {
            cfg.trace = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|d| !d.trim().is_empty()) {
            cfg.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(n) = lookup(ENV_MIN_CACHE_LEN).and_then(|v| v.trim().parse::<usize>().ok()) {
            cfg.min_cache_len = n;
        }
        cfg
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_min_cache_len(mut self, len: usize) -> Self {
        self.min_cache_len = len;
        self
    }
}
