//! 统一错误类型定义.
//!
//! 复用引擎的所有致命条件都以 `MuxError` 返回给调用方, 不做部分输出挽救.

use thiserror::Error;

/// 复用器统一错误类型
#[derive(Debug, Error)]
pub enum MuxError {
    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 不支持的输入或操作
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    /// 码流头部损坏、同步字缺失或帧边界不一致
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// 配置违规 (VBR 无码率、流数量超限等), 在会话初始化时检测
    #[error("配置错误: {0}")]
    Config(String),

    /// 缓冲区欠载次数超过上限
    #[error("缓冲区欠载过多: {count} 次 (上限 {limit})")]
    Underrun { count: u32, limit: u32 },

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 输出端短写
    #[error("输出短写: 期望 {expected} 字节, 实际写入 {written} 字节")]
    ShortWrite { expected: usize, written: usize },

    /// 已到达流末尾
    #[error("已到达流末尾")]
    Eof,

    /// 内部错误 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 复用器统一 Result 类型
pub type MuxResult<T> = Result<T, MuxError>;
