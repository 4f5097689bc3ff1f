//! 节目流二进制编码器.
//!
//! 按 MPEG 系统层规范逐位写出 Pack 头、系统头、分组头与完整定长扇区,
//! 同时支持 MPEG-1 与 MPEG-2 两种语法. 扇区内容由 `BitWriter` 写入,
//! 长度字段先占位后回填.

use mplex_core::timestamp::{base_90khz, extension};
use mplex_core::{BitWriter, ClockTicks, MuxError, MuxResult};

use crate::mux_stream::{
    BufferRecord, MuxStreamState, PADDING_STR, PRIVATE_STR_2, PacketPayload,
};

/// 起始码前缀
pub const START_CODE_PREFIX: u32 = 0x00_0001;
/// Pack 起始码
pub const PACK_START_CODE: u32 = 0x0000_01BA;
/// 系统头起始码
pub const SYS_HEADER_START_CODE: u32 = 0x0000_01BB;
/// 节目流结束码
pub const ISO11172_END_CODE: u32 = 0x0000_01B9;

pub const MPEG1_PACK_HEADER_SIZE: usize = 12;
pub const MPEG2_PACK_HEADER_SIZE: usize = 14;
/// 起始码 + 流 ID + 长度
pub const PACKET_HEADER_SIZE: usize = 6;
/// 系统头固定部分
pub const SYS_HEADER_FIXED_SIZE: usize = 12;
/// 缺口小于此值时用分组头填充, 否则插入填充分组
pub const MIN_PADDING_PACKET_SIZE: usize = 10;
/// 单个 PTS/DTS 字段长度
pub const TIMESTAMP_LENGTH: usize = 5;
/// DVD 导航扇区中 PCI 分组的结束位置
pub const DVD_PCI_END: usize = 1024;
pub const DVD_SECTOR_SIZE: usize = 2048;

/// 时间戳标记码
const MARKER_PTS_ONLY: u32 = 0b0010;
const MARKER_PTS_WITH_DTS: u32 = 0b0011;
const MARKER_DTS: u32 = 0b0001;
const MARKER_MPEG1_SCR: u32 = 0b0010;

/// Pack 头参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHeader {
    pub scr: ClockTicks,
    /// 复用码率 (50 字节/秒 单位)
    pub mux_rate: u32,
}

/// 系统头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemHeader {
    pub rate_bound: u32,
    pub audio_bound: u8,
    pub video_bound: u8,
    pub fixed: bool,
    pub csps: bool,
    pub audio_lock: bool,
    pub video_lock: bool,
    pub records: Vec<BufferRecord>,
}

impl SystemHeader {
    /// 由流集合生成系统头, 音视频数目从流 ID 推导
    pub fn new(
        rate_bound: u32,
        fixed: bool,
        csps: bool,
        audio_lock: bool,
        video_lock: bool,
        records: Vec<BufferRecord>,
        audio_bound: u8,
        video_bound: u8,
    ) -> Self {
        Self {
            rate_bound,
            audio_bound,
            video_bound,
            fixed,
            csps,
            audio_lock,
            video_lock,
            records,
        }
    }

    /// 总字节数
    pub fn len(&self) -> usize {
        SYS_HEADER_FIXED_SIZE + 3 * self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// 分组头中的时间戳字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamps {
    None,
    Pts(ClockTicks),
    PtsDts(ClockTicks, ClockTicks),
}

impl Timestamps {
    fn byte_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Pts(_) => TIMESTAMP_LENGTH,
            Self::PtsDts(..) => 2 * TIMESTAMP_LENGTH,
        }
    }

    fn flag_bits(self) -> u8 {
        match self {
            Self::None => 0b00,
            Self::Pts(_) => 0b10,
            Self::PtsDts(..) => 0b11,
        }
    }

    pub fn is_some(self) -> bool {
        self != Self::None
    }
}

/// 扇区中分组之前/之后的结构
#[derive(Debug, Clone, Copy, Default)]
pub struct SectorLayout<'a> {
    pub pack: Option<PackHeader>,
    pub sys_header: Option<&'a SystemHeader>,
    /// 扇区末尾追加结束码
    pub end_marker: bool,
}

/// 由流的扇区规划给出的分组参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRequest {
    /// 数据载荷上限 (不含子流头), 0 表示填满扇区
    pub max_payload: usize,
    /// 写缓冲记录
    pub buffers: bool,
    pub timestamps: Timestamps,
}

impl SectorRequest {
    /// 不带时间戳与缓冲记录的续传分组
    pub fn continuation(max_payload: usize, buffers: bool) -> Self {
        Self {
            max_payload,
            buffers,
            timestamps: Timestamps::None,
        }
    }
}

/// 扇区渲染结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectorOutcome {
    /// 实际载荷 (含子流头)
    pub payload: usize,
    /// 分组头填充字节
    pub stuffing: usize,
    /// 填充分组总长, 0 表示无
    pub padding: usize,
}

/// 节目流编码器
pub struct PsEncoder {
    mpeg: u8,
    sector_size: usize,
    scratch: Vec<u8>,
}

impl PsEncoder {
    pub fn new(mpeg: u8, sector_size: usize) -> Self {
        Self {
            mpeg,
            sector_size,
            scratch: vec![0u8; sector_size],
        }
    }

    pub fn mpeg_version(&self) -> u8 {
        self.mpeg
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn pack_header_len(&self) -> usize {
        if self.mpeg == 2 {
            MPEG2_PACK_HEADER_SIZE
        } else {
            MPEG1_PACK_HEADER_SIZE
        }
    }

    /// MPEG-2 填充流与私有流 2 的分组头只有 6 字节
    fn has_pes_extension(&self, stream_id: u8) -> bool {
        self.mpeg == 2 && stream_id != PADDING_STR && stream_id != PRIVATE_STR_2
    }

    /// 分组头总长 (含 6 字节固定部分)
    pub fn packet_header_len(
        &self,
        stream_id: u8,
        buffers: bool,
        timestamps: Timestamps,
        stuffing: usize,
    ) -> usize {
        if self.mpeg == 1 {
            let ts = if timestamps.is_some() {
                timestamps.byte_len()
            } else {
                1
            };
            PACKET_HEADER_SIZE + stuffing + if buffers { 2 } else { 0 } + ts
        } else if self.has_pes_extension(stream_id) {
            PACKET_HEADER_SIZE + 3 + if buffers { 3 } else { 0 } + timestamps.byte_len() + stuffing
        } else {
            PACKET_HEADER_SIZE
        }
    }

    fn layout_overhead(&self, state: &MuxStreamState, layout: &SectorLayout<'_>) -> usize {
        layout.pack.map_or(0, |_| self.pack_header_len())
            + layout.sys_header.map_or(0, |s| s.len())
            + if layout.end_marker { 4 } else { 0 }
            + state.zero_stuffing
    }

    /// 给定扇区结构下一个分组可携带的数据载荷 (不含子流头)
    pub fn packet_payload(
        &self,
        state: &MuxStreamState,
        sub_header_len: usize,
        layout: &SectorLayout<'_>,
        buffers: bool,
        timestamps: Timestamps,
    ) -> usize {
        self.sector_size
            .saturating_sub(self.layout_overhead(state, layout))
            .saturating_sub(self.packet_header_len(state.stream_id, buffers, timestamps, 0))
            .saturating_sub(sub_header_len)
    }

    /// 写 Pack 头
    pub fn write_pack_header(&self, w: &mut BitWriter<'_>, pack: &PackHeader) -> MuxResult<()> {
        w.write_u32(PACK_START_CODE)?;
        let base = base_90khz(pack.scr);
        if self.mpeg == 2 {
            w.write_bits(0b01, 2)?;
            write_clock_fields(w, base)?;
            w.write_bits(extension(pack.scr), 9)?;
            w.write_bit(true)?;
            w.write_bits(pack.mux_rate, 22)?;
            w.write_bits(0b11, 2)?;
            // 5 位保留 + 3 位 pack_stuffing_length = 0
            w.write_u8(0xF8)?;
        } else {
            w.write_bits(MARKER_MPEG1_SCR, 4)?;
            write_clock_fields(w, base)?;
            w.write_bit(true)?;
            w.write_bits(pack.mux_rate, 22)?;
            w.write_bit(true)?;
        }
        Ok(())
    }

    /// 写系统头
    pub fn write_system_header(&self, w: &mut BitWriter<'_>, sys: &SystemHeader) -> MuxResult<()> {
        w.write_u32(SYS_HEADER_START_CODE)?;
        w.write_u16((sys.len() - PACKET_HEADER_SIZE) as u16)?;
        w.write_bit(true)?;
        w.write_bits(sys.rate_bound, 22)?;
        w.write_bit(true)?;
        w.write_bits(u32::from(sys.audio_bound), 6)?;
        w.write_bit(sys.fixed)?;
        w.write_bit(sys.csps)?;
        w.write_bit(sys.audio_lock)?;
        w.write_bit(sys.video_lock)?;
        w.write_bit(true)?;
        w.write_bits(u32::from(sys.video_bound), 5)?;
        w.write_u8(0xFF)?;
        for rec in &sys.records {
            w.write_u8(rec.stream_id)?;
            w.write_bits(0b11, 2)?;
            w.write_bits(u32::from(rec.scale), 1)?;
            w.write_bits(u32::from(rec.size_code), 13)?;
        }
        Ok(())
    }

    /// 写分组头, 返回长度字段所在位置
    fn write_packet_header(
        &self,
        w: &mut BitWriter<'_>,
        state: &MuxStreamState,
        buffers: bool,
        timestamps: Timestamps,
        stuffing: usize,
    ) -> MuxResult<usize> {
        w.write_bits(START_CODE_PREFIX, 24)?;
        w.write_u8(state.stream_id)?;
        let length_at = w.position();
        w.write_u16(0)?;

        if self.mpeg == 1 {
            // MPEG-1 语法规定填充字节位于可选字段之前
            w.fill(0xFF, stuffing)?;
            if buffers {
                write_buffer_field(w, state)?;
            }
            write_timestamps(w, timestamps, 0x0F)?;
        } else if self.has_pes_extension(state.stream_id) {
            w.write_u8(0x81)?;
            w.write_u8((timestamps.flag_bits() << 6) | u8::from(buffers))?;
            let header_data_len = timestamps.byte_len() + if buffers { 3 } else { 0 } + stuffing;
            w.write_u8(header_data_len as u8)?;
            write_timestamps(w, timestamps, 0)?;
            if buffers {
                // P-STD_buffer_flag 置位, 其余扩展标志清零
                w.write_u8(0x1E)?;
                write_buffer_field(w, state)?;
            }
            w.fill(0xFF, stuffing)?;
        } else if stuffing > 0 {
            return Err(MuxError::Internal(format!(
                "流 0x{:02X} 的 MPEG-2 分组头不能携带填充",
                state.stream_id
            )));
        }
        Ok(length_at)
    }

    /// 写独立的填充分组, 总长 `size` 字节
    fn write_padding_packet(&self, w: &mut BitWriter<'_>, size: usize) -> MuxResult<()> {
        if size < PACKET_HEADER_SIZE + 1 {
            return Err(MuxError::Internal(format!("填充分组过短: {}", size)));
        }
        w.write_bits(START_CODE_PREFIX, 24)?;
        w.write_u8(PADDING_STR)?;
        w.write_u16((size - PACKET_HEADER_SIZE) as u16)?;
        if self.mpeg == 1 {
            w.write_u8(0x0F)?;
            w.fill(0xFF, size - PACKET_HEADER_SIZE - 1)?;
        } else {
            w.fill(0xFF, size - PACKET_HEADER_SIZE)?;
        }
        Ok(())
    }

    /// 渲染一个完整扇区
    ///
    /// 依次写入可选 Pack 头、可选系统头、分组头与载荷. 载荷不足时:
    /// 缺口小于 10 字节用分组头填充, 否则追加填充分组. 结果长度恒为扇区大小.
    pub fn render_sector(
        &mut self,
        out: &mut [u8],
        src: &mut dyn PacketPayload,
        layout: &SectorLayout<'_>,
        req: &SectorRequest,
    ) -> MuxResult<SectorOutcome> {
        if out.len() != self.sector_size {
            return Err(MuxError::Internal(format!(
                "扇区缓冲 {} 字节, 期望 {}",
                out.len(),
                self.sector_size
            )));
        }
        let state = src.mux_state().clone();
        let header_len = self.packet_header_len(state.stream_id, req.buffers, req.timestamps, 0);
        let overhead = self.layout_overhead(&state, layout) + header_len;
        let capacity = self.sector_size.checked_sub(overhead).ok_or_else(|| {
            MuxError::Internal(format!(
                "扇区开销 {} 超过扇区大小 {}",
                overhead, self.sector_size
            ))
        })?;

        let sub_len = src.sub_header_len();
        let want = if req.max_payload > 0 {
            capacity.min(req.max_payload + sub_len)
        } else {
            capacity
        };
        if self.scratch.len() < capacity {
            self.scratch.resize(capacity, 0);
        }
        let actual = src.read_payload(&mut self.scratch[..want])?;
        let shortfall = capacity - actual;
        let (stuffing, padding) = match shortfall {
            0 => (0, 0),
            n if n < MIN_PADDING_PACKET_SIZE && self.mpeg == 1 => (n, 0),
            n if n < MIN_PADDING_PACKET_SIZE && self.has_pes_extension(state.stream_id) => (n, 0),
            n if n < MIN_PADDING_PACKET_SIZE => {
                return Err(MuxError::Internal(format!(
                    "流 0x{:02X} 缺口 {} 字节无法填充",
                    state.stream_id, n
                )));
            }
            n => (0, n),
        };

        let mut w = BitWriter::new(out);
        if let Some(pack) = &layout.pack {
            self.write_pack_header(&mut w, pack)?;
        }
        if let Some(sys) = layout.sys_header {
            self.write_system_header(&mut w, sys)?;
        }
        let packet_start = w.position();
        let length_at = self.write_packet_header(&mut w, &state, req.buffers, req.timestamps, stuffing)?;
        w.write_bytes(&self.scratch[..actual])?;
        let packet_len = w.position() - packet_start - PACKET_HEADER_SIZE;
        w.patch_u16(length_at, packet_len as u16)?;

        if padding > 0 {
            self.write_padding_packet(&mut w, padding)?;
        }
        if layout.end_marker {
            w.write_u32(ISO11172_END_CODE)?;
        }
        w.fill(0, state.zero_stuffing)?;

        if w.position() != self.sector_size {
            return Err(MuxError::Internal(format!(
                "扇区长度 {} 与扇区大小 {} 不符",
                w.position(),
                self.sector_size
            )));
        }
        Ok(SectorOutcome {
            payload: actual,
            stuffing,
            padding,
        })
    }

    /// 渲染 DVD 导航扇区: Pack 头 + 系统头 + PCI 分组 (结束于 1024) + DSI 分组 (结束于 2048)
    pub fn render_nav_sector(
        &self,
        out: &mut [u8],
        pack: &PackHeader,
        sys: &SystemHeader,
    ) -> MuxResult<()> {
        if self.mpeg != 2 || out.len() != DVD_SECTOR_SIZE {
            return Err(MuxError::Config(format!(
                "导航扇区需要 MPEG-2 与 {} 字节扇区",
                DVD_SECTOR_SIZE
            )));
        }
        let mut w = BitWriter::new(out);
        self.write_pack_header(&mut w, pack)?;
        self.write_system_header(&mut w, sys)?;
        let pci_start = w.position();
        if pci_start + PACKET_HEADER_SIZE + 1 >= DVD_PCI_END {
            return Err(MuxError::Internal(format!("系统头过长: {}", sys.len())));
        }
        for (sub_id, end) in [(0x00u8, DVD_PCI_END), (0x01, DVD_SECTOR_SIZE)] {
            let body = end - w.position() - PACKET_HEADER_SIZE;
            w.write_bits(START_CODE_PREFIX, 24)?;
            w.write_u8(PRIVATE_STR_2)?;
            w.write_u16(body as u16)?;
            w.write_u8(sub_id)?;
            w.fill(0, body - 1)?;
        }
        Ok(())
    }
}

/// 33 位时钟按 3/15/15 位拆分, 每段后跟标记位 1
fn write_clock_fields(w: &mut BitWriter<'_>, base: u64) -> MuxResult<()> {
    w.write_bits_u64((base >> 30) & 0x7, 3)?;
    w.write_bit(true)?;
    w.write_bits_u64((base >> 15) & 0x7FFF, 15)?;
    w.write_bit(true)?;
    w.write_bits_u64(base & 0x7FFF, 15)?;
    w.write_bit(true)
}

/// 5 字节 PTS/DTS 字段
fn write_timestamp(w: &mut BitWriter<'_>, marker: u32, ticks: ClockTicks) -> MuxResult<()> {
    w.write_bits(marker, 4)?;
    write_clock_fields(w, base_90khz(ticks))
}

fn write_timestamps(w: &mut BitWriter<'_>, ts: Timestamps, no_stamp: u8) -> MuxResult<()> {
    match ts {
        Timestamps::None => {
            // MPEG-1 无时间戳时写 0x0F 标记字节, MPEG-2 不写
            if no_stamp != 0 {
                w.write_u8(no_stamp)?;
            }
        }
        Timestamps::Pts(pts) => write_timestamp(w, MARKER_PTS_ONLY, pts)?,
        Timestamps::PtsDts(pts, dts) => {
            write_timestamp(w, MARKER_PTS_WITH_DTS, pts)?;
            write_timestamp(w, MARKER_DTS, dts)?;
        }
    }
    Ok(())
}

/// `01` + scale + 13 位 size
fn write_buffer_field(w: &mut BitWriter<'_>, state: &MuxStreamState) -> MuxResult<()> {
    w.write_bits(0b01, 2)?;
    w.write_bits(u32::from(state.buffer_scale), 1)?;
    w.write_bits(u32::from(state.buffer_size_code()), 13)
}
