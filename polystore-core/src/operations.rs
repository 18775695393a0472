//! Operation options

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOptions {
    pub recursive: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadOptions {
    /// Half-open byte range `[start, end)`
    pub range: Option<(u64, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOptions {
    pub overwrite: bool,
    pub create_parents: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { overwrite: true, create_parents: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub recursive: bool,
    pub force: bool,
}
