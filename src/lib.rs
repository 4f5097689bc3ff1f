//! # tao-mplex
//!
//! 纯 Rust 实现的 MPEG-1/2 节目流 (Program Stream) 复用器, 对标 mjpegtools mplex.
//!
//! - **码流扫描**: MPEG-1/2 视频、MPEG 音频 (Layer I/II/III)、AC-3、LPCM
//! - **缓冲模拟**: 按 DTS 模拟解码缓冲占用, 保证不溢出不欠载
//! - **扇区编码**: Pack 头、系统头、PES 分组, 支持 MPEG-1 与 MPEG-2 语法
//! - **输出格式**: 通用 MPEG-1/2、VCD、SVCD、DVD 及静止图像格式
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::path::Path;
//! use tao_mplex::mux::{FileSink, MuxConfig, MuxFormat, Multiplexor, StreamInput};
//!
//! let config = MuxConfig {
//!     format: MuxFormat::Vcd,
//!     ..Default::default()
//! };
//! let inputs = vec![
//!     StreamInput::open(Path::new("video.m1v")).unwrap(),
//!     StreamInput::open(Path::new("audio.mp2")).unwrap(),
//! ];
//! let sink = FileSink::create("out.mpg").unwrap();
//! let mut mux = Multiplexor::new(config, inputs, sink).unwrap();
//! let summary = mux.multiplex().unwrap();
//! println!("{} 个扇区", summary.sectors);
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `mplex-core` | 错误类型、比特流读写、时钟换算 |
//! | `mplex-mux` | 扫描器、缓冲模型、扇区编码、复用驱动 |

/// 核心类型与工具
pub use mplex_core as core;

/// 复用引擎
pub use mplex_mux as mux;

/// 库版本
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
