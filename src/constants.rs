/// Upper bound of repetitions of one level within an episode.
pub const MAX_REPETITIONS: usize = 5;

pub const DEFAULT_CONFIG_PATH: &str = "implbench.toml";
pub const DEFAULT_DB_PATH: &str = "implbench.db";
pub const DEFAULT_SOURCE_DIR: &str = "src";

pub const WORKDIR_PREFIX: &str = "implbench-";
