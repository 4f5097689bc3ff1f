//! 每条输出流的复用簿记.
//!
//! 由扫描器填充、编码器消费: 流 ID、缓冲大小类别、零填充需求、已输出扇区数、
//! 下一扇区是否以新 AU 开始、分组载荷上下限. 填充流与 DVD 控制流也各有一份.

use mplex_core::MuxResult;

/// 填充流 ID
pub const PADDING_STR: u8 = 0xBE;
/// 私有流 1 (AC-3 / LPCM 子流)
pub const PRIVATE_STR_1: u8 = 0xBD;
/// 私有流 2 (DVD 导航)
pub const PRIVATE_STR_2: u8 = 0xBF;
/// MPEG 音频流 ID 基值
pub const AUDIO_STR_0: u8 = 0xC0;
/// MPEG 视频流 ID 基值
pub const VIDEO_STR_0: u8 = 0xE0;
/// AC-3 子流 ID 基值
pub const AC3_SUB_STR_0: u8 = 0x80;
/// LPCM 子流 ID 基值
pub const LPCM_SUB_STR_0: u8 = 0xA0;
/// DVD 系统头中代表全部视频流的 ID
pub const ALL_VIDEO_STR: u8 = 0xB9;
/// DVD 系统头中代表全部音频流的 ID
pub const ALL_AUDIO_STR: u8 = 0xB8;

/// 系统头中的一条缓冲记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRecord {
    pub stream_id: u8,
    /// 0: 128 字节单位, 1: 1024 字节单位
    pub scale: u8,
    /// 13 位大小代码
    pub size_code: u16,
}

impl BufferRecord {
    pub fn new(stream_id: u8, scale: u8, size: u32) -> Self {
        Self {
            stream_id,
            scale,
            size_code: buffer_size_code(scale, size),
        }
    }
}

/// 缓冲字节数换算为 13 位大小代码 (向上取整)
pub fn buffer_size_code(scale: u8, size: u32) -> u16 {
    let unit = if scale == 0 { 128 } else { 1024 };
    size.div_ceil(unit).min(0x1FFF) as u16
}

/// 每条输出流的复用状态
#[derive(Debug, Clone)]
pub struct MuxStreamState {
    pub stream_id: u8,
    /// 私有流子流 ID
    pub sub_stream_id: Option<u8>,
    pub buffer_scale: u8,
    /// 解码缓冲大小 (字节)
    pub buffer_size: u32,
    /// 扇区尾部零填充字节数
    pub zero_stuffing: usize,
    /// 新 AU 分组写缓冲记录
    pub buffers_in_header: bool,
    /// 每个分组都写缓冲记录
    pub always_buffers_in_header: bool,
    /// 下一扇区以新 AU 开始
    pub new_au_next_sec: bool,
    /// 已输出扇区数
    pub nsec: u64,
    /// 载荷上限 (无包头/系统头/时间戳)
    pub max_packet_data: usize,
    /// 载荷下限 (带包头/系统头/缓冲记录/时间戳)
    pub min_packet_data: usize,
}

impl MuxStreamState {
    pub fn new(stream_id: u8, buffer_scale: u8, buffer_size: u32) -> Self {
        Self {
            stream_id,
            sub_stream_id: None,
            buffer_scale,
            buffer_size,
            zero_stuffing: 0,
            buffers_in_header: false,
            always_buffers_in_header: false,
            new_au_next_sec: true,
            nsec: 0,
            max_packet_data: 0,
            min_packet_data: 0,
        }
    }

    pub fn with_sub_stream(mut self, sub_id: u8) -> Self {
        self.sub_stream_id = Some(sub_id);
        self
    }

    pub fn with_zero_stuffing(mut self, bytes: usize) -> Self {
        self.zero_stuffing = bytes;
        self
    }

    pub fn with_buffers(mut self, in_header: bool, always: bool) -> Self {
        self.buffers_in_header = in_header;
        self.always_buffers_in_header = always;
        self
    }

    pub fn buffer_size_code(&self) -> u16 {
        buffer_size_code(self.buffer_scale, self.buffer_size)
    }

    pub fn buffer_record(&self) -> BufferRecord {
        BufferRecord {
            stream_id: self.stream_id,
            scale: self.buffer_scale,
            size_code: self.buffer_size_code(),
        }
    }

    /// 调度平局时的排序键: (流 ID, 子流 ID)
    pub fn sort_key(&self) -> (u8, u8) {
        (self.stream_id, self.sub_stream_id.unwrap_or(0))
    }

    pub fn is_video(&self) -> bool {
        self.stream_id & 0xF0 == VIDEO_STR_0
    }

    /// 包含私有流子流 (AC-3 / LPCM)
    pub fn is_audio(&self) -> bool {
        self.stream_id & 0xE0 == AUDIO_STR_0 || self.stream_id == PRIVATE_STR_1
    }
}

/// 能够向分组提供载荷的流
pub trait PacketPayload {
    fn mux_state(&self) -> &MuxStreamState;

    /// 子流头长度 (AC-3 4 字节, LPCM 7 字节, 其余 0)
    fn sub_header_len(&self) -> usize {
        0
    }

    /// 向 `dst` 写入至多 `dst.len()` 字节载荷 (含子流头), 返回写入数量
    fn read_payload(&mut self, dst: &mut [u8]) -> MuxResult<usize>;
}

/// 填充流: 载荷全部为 0xFF
#[derive(Debug, Clone)]
pub struct PaddingStream {
    state: MuxStreamState,
}

impl PaddingStream {
    /// 普通填充流
    pub fn new() -> Self {
        Self {
            state: MuxStreamState::new(PADDING_STR, 0, 0),
        }
    }

    /// VCD 音频前缀扇区使用的填充流, 尾部带零填充
    pub fn vcd_audio(zero_stuffing: usize) -> Self {
        Self {
            state: MuxStreamState::new(PADDING_STR, 0, 0).with_zero_stuffing(zero_stuffing),
        }
    }
}

impl Default for PaddingStream {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketPayload for PaddingStream {
    fn mux_state(&self) -> &MuxStreamState {
        &self.state
    }

    fn read_payload(&mut self, dst: &mut [u8]) -> MuxResult<usize> {
        dst.fill(0xFF);
        self.state.nsec += 1;
        Ok(dst.len())
    }
}

/// DVD 导航控制流 (私有流 2)
pub fn dvd_control_state() -> MuxStreamState {
    MuxStreamState::new(PRIVATE_STR_2, 1, 2048)
}
