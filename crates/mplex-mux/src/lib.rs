//! # mplex-mux
//!
//! MPEG-1/2 节目流复用引擎.
//!
//! 扫描 MPEG 视频、MPEG 音频、AC-3 与 LPCM 基本流, 按解码缓冲模型调度,
//! 输出 VCD/SVCD/DVD 等格式的定长扇区节目流.

pub mod au;
pub mod buffer_model;
pub mod encoder;
pub mod inspect;
pub mod io;
pub mod multiplexor;
pub mod mux_stream;
pub mod profile;
pub mod streams;

pub use au::{AccessUnit, FrameType};
pub use io::{FileSink, InputKind, MemorySink, SectorSink, StreamInput};
pub use multiplexor::{MuxSummary, Multiplexor};
pub use profile::{MuxConfig, MuxFormat, SyntaxParams};
pub use streams::ElementaryStream;
