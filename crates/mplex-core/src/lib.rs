//! # mplex-core
//!
//! tao-mplex 核心库, 提供错误类型、比特流读写与时钟换算.
//!
//! 复用引擎 (mplex-mux) 的所有底层基础设施均位于此处.

pub mod bitreader;
pub mod bitwriter;
pub mod error;
pub mod rational;
pub mod timestamp;

// 重导出常用类型
pub use bitreader::BitReader;
pub use bitwriter::BitWriter;
pub use error::{MuxError, MuxResult};
pub use rational::FrameRate;
pub use timestamp::ClockTicks;
