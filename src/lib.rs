//! WeebCentral 漫画下载器。
//!
//! 代码结构：
//! - `base_system`：配置、日志、重试策略、磁盘命名
//! - `download`：目录解析、带检查点的章节下载、调度
//! - `network_parser`：WeebCentral 页面解析
//! - `ui`：命令行前端

pub mod base_system;
pub mod download;
pub mod network_parser;
pub mod ui;
