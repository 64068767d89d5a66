//! 实现下载流程列表 trait 的站点解析器。

pub mod weebcentral;
