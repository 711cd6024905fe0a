/// Configuration for a chaindb instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of each heap segment file (default: 2 GiB). Must be a positive
    /// multiple of 32; a single stored payload cannot exceed it.
    pub segment_size: i64,

    /// Fsync every metadata write (default: true). Disabling this voids the
    /// crash-safety guarantees and is only meant for tests.
    pub sync_writes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_size: 2048 * 1024 * 1024, // 2 GiB
            sync_writes: true,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heap segment file size
    pub fn segment_size(mut self, size: i64) -> Self {
        self.segment_size = size;
        self
    }

    /// Toggle fsync on metadata writes
    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.segment_size, 2048 * 1024 * 1024);
        assert!(config.sync_writes);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new().segment_size(4096).sync_writes(false);
        assert_eq!(config.segment_size, 4096);
        assert!(!config.sync_writes);
    }
}
