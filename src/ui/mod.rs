//! 前端。目前只有纯命令行一种。

pub mod noui;
