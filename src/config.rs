#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Number of transaction ids reserved by every journaled limit.
    pub txn_limit_step: u32,
    /// File grows beyond `initial_size * growth_factor` before rotation.
    pub growth_factor: u64,
    /// Minimum file size before the growth factor kicks in.
    pub growth_baseline: u64,
}

#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// Approximate byte size before the active segment is sealed and a new one started.
    pub segment_target_size: u64,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Number of independently locked partitions of the address map.
    pub shard_count: usize,
}

/// Configuration for a tile vault and all its components.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub journal: JournalConfig,
    pub blob: BlobConfig,
    pub index: IndexConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            journal: JournalConfig {
                txn_limit_step: 1_000,
                growth_factor: 2,
                growth_baseline: 8 * 1024 * 1024, // 8 MiB
            },
            blob: BlobConfig {
                segment_target_size: 256 * 1024 * 1024, // 256 MiB
            },
            index: IndexConfig { shard_count: 64 },
        }
    }
}

impl VaultConfig {
    /// A config tuned for fast testing.
    ///
    /// - **journal:** Small reservation steps and files, so limits and rotation are exercised.
    /// - **blob:** Tiny segments force frequent rotation and reclamation.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            journal: JournalConfig {
                txn_limit_step: 4,
                growth_factor: 2,
                growth_baseline: 2 * 1024,
            },
            blob: BlobConfig {
                segment_target_size: 256,
            },
            index: IndexConfig { shard_count: 4 },
        }
    }
}
