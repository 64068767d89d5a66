//! 下载流程与前端共用的基础设施：配置、日志、重试策略、磁盘命名。

pub mod atomic_write;
pub mod config;
pub mod context;
pub mod logging;
pub mod retry;
pub mod series_paths;
