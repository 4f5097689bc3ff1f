//! I/O 抽象层.
//!
//! 输入: 每条基本流一个拉取式字节源 (`std::io::Read`), 读到 0 字节即流末尾.
//! 输出: 推送式扇区接收端 `SectorSink`, 任何短写都是致命错误.
//! 复用核心自身不做文件 I/O, 文件与内存实现位于此处供调用方选用.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;

use mplex_core::{MuxError, MuxResult};

/// 扇区接收端
pub trait SectorSink {
    /// 写入数据, 返回实际写入字节数
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// 开始下一个输出分段 (文件)
    fn next_segment(&mut self) -> MuxResult<()>;

    /// 刷新缓冲
    fn flush(&mut self) -> io::Result<()>;
}

/// 写入一个完整扇区, 短写视为致命错误
pub fn write_sector<S: SectorSink + ?Sized>(sink: &mut S, sector: &[u8]) -> MuxResult<()> {
    let written = sink.write(sector)?;
    if written != sector.len() {
        return Err(MuxError::ShortWrite {
            expected: sector.len(),
            written,
        });
    }
    Ok(())
}

/// 文件输出
///
/// 路径模板中的 `%d` 替换为分段序号 (从 1 开始); 不含 `%d` 时,
/// 首个分段使用原路径, 后续分段在扩展名前追加序号.
pub struct FileSink {
    template: String,
    segment: u32,
    writer: BufWriter<File>,
    paths: Vec<PathBuf>,
}

impl FileSink {
    /// 创建首个分段文件
    pub fn create(template: &str) -> MuxResult<Self> {
        let path = Self::segment_path(template, 1);
        let file = File::create(&path)?;
        log::debug!("创建输出文件: {}", path.display());
        Ok(Self {
            template: template.to_string(),
            segment: 1,
            writer: BufWriter::new(file),
            paths: vec![path],
        })
    }

    /// 由模板生成第 n 个分段的路径
    pub fn segment_path(template: &str, n: u32) -> PathBuf {
        if template.contains("%d") {
            return PathBuf::from(template.replace("%d", &n.to_string()));
        }
        if n == 1 {
            return PathBuf::from(template);
        }
        let path = Path::new(template);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match path.extension() {
            Some(ext) => format!("{}{:02}.{}", stem, n, ext.to_string_lossy()),
            None => format!("{}{:02}", stem, n),
        };
        path.with_file_name(name)
    }

    /// 已创建的全部分段路径
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl SectorSink for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write_all(buf)?;
        Ok(buf.len())
    }

    fn next_segment(&mut self) -> MuxResult<()> {
        self.writer.flush()?;
        self.segment += 1;
        let path = Self::segment_path(&self.template, self.segment);
        if self.paths.contains(&path) {
            return Err(MuxError::Config(format!(
                "输出路径模板 {} 无法区分分段, 需要包含 %d",
                self.template
            )));
        }
        log::info!("切换输出文件: {}", path.display());
        self.writer = BufWriter::new(File::create(&path)?);
        self.paths.push(path);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// 内存输出, 每个分段一个缓冲
///
/// 用于测试和内存中处理.
#[derive(Debug, Default)]
pub struct MemorySink {
    segments: Vec<BytesMut>,
}

impl MemorySink {
    /// 创建空的内存输出 (含首个分段)
    pub fn new() -> Self {
        Self {
            segments: vec![BytesMut::new()],
        }
    }

    /// 全部分段
    pub fn segments(&self) -> &[BytesMut] {
        &self.segments
    }

    /// 所有分段拼接后的数据
    pub fn data(&self) -> Vec<u8> {
        self.segments.iter().flat_map(|s| s.iter().copied()).collect()
    }

    /// 消费并返回各分段数据
    pub fn into_segments(self) -> Vec<Vec<u8>> {
        self.segments.into_iter().map(|s| s.to_vec()).collect()
    }
}

impl SectorSink for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.segments.is_empty() {
            self.segments.push(BytesMut::new());
        }
        let last = self.segments.len() - 1;
        self.segments[last].extend_from_slice(buf);
        Ok(buf.len())
    }

    fn next_segment(&mut self) -> MuxResult<()> {
        self.segments.push(BytesMut::new());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 输入基本流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// MPEG-1/2 视频
    MpegVideo,
    /// MPEG 音频 (Layer I/II/III)
    MpegAudio,
    /// AC-3 音频
    Ac3,
    /// 线性 PCM (48kHz, 2 声道, 16 位, 大端)
    Lpcm,
}

impl InputKind {
    /// 探测流类型: 检查起始字节, 无头部的 LPCM 依赖扩展名
    pub fn probe(header: &[u8], path: Option<&Path>) -> Option<Self> {
        let ext = path
            .and_then(|p| p.extension())
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        if matches!(ext.as_deref(), Some("lpcm") | Some("pcm")) {
            return Some(Self::Lpcm);
        }
        if header.len() >= 4 && header[..4] == [0x00, 0x00, 0x01, 0xB3] {
            return Some(Self::MpegVideo);
        }
        if header.len() >= 2 && header[0] == 0x0B && header[1] == 0x77 {
            return Some(Self::Ac3);
        }
        // 11 位同步字, 且 version/layer 不是保留值
        if header.len() >= 2
            && header[0] == 0xFF
            && header[1] & 0xE0 == 0xE0
            && header[1] & 0x18 != 0x08
            && header[1] & 0x06 != 0x00
        {
            return Some(Self::MpegAudio);
        }
        None
    }

    pub fn is_video(self) -> bool {
        self == Self::MpegVideo
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::MpegVideo => "MPEG 视频",
            Self::MpegAudio => "MPEG 音频",
            Self::Ac3 => "AC-3",
            Self::Lpcm => "LPCM",
        }
    }
}

/// 一条输入基本流
pub struct StreamInput {
    pub kind: InputKind,
    /// 显示名称 (日志用)
    pub name: String,
    pub source: Box<dyn Read + Send>,
}

impl StreamInput {
    /// 由已知类型与字节源创建
    pub fn new<R: Read + Send + 'static>(kind: InputKind, name: &str, source: R) -> Self {
        Self {
            kind,
            name: name.to_string(),
            source: Box::new(source),
        }
    }

    /// 打开文件并探测类型
    pub fn open(path: &Path) -> MuxResult<Self> {
        let mut file = File::open(path)?;
        let mut header = [0u8; 4];
        let mut got = 0;
        while got < header.len() {
            let n = file.read(&mut header[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        let kind = InputKind::probe(&header[..got], Some(path)).ok_or_else(|| {
            MuxError::Unsupported(format!("无法识别的基本流: {}", path.display()))
        })?;
        // 已读取的头部字节拼回字节源前端
        let source = io::Cursor::new(header[..got].to_vec()).chain(file);
        log::debug!("输入 {}: {}", path.display(), kind.name());
        Ok(Self {
            kind,
            name: path.display().to_string(),
            source: Box::new(source),
        })
    }
}
