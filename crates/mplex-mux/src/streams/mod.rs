//! 基本流: 扫描器 + AU 环 + 解码缓冲模型 + 复用状态.
//!
//! 扫描器在复用游标之前预扫若干 AU, 复用时按 AU 精确地从比特流缓冲中
//! 拷贝载荷, 同时把送出的字节按 DTS 记入解码缓冲模型.

pub mod ac3;
pub mod lpcm;
pub mod mpa;
pub mod video;

use mplex_core::{BitReader, ClockTicks, MuxError, MuxResult};

use crate::au::{AccessUnit, AuRing, FrameType};
use crate::buffer_model::BufferModel;
use crate::encoder::{PsEncoder, SectorLayout, SectorRequest, Timestamps};
use crate::io::{InputKind, StreamInput};
use crate::mux_stream::{
    AC3_SUB_STR_0, AUDIO_STR_0, LPCM_SUB_STR_0, MuxStreamState, PRIVATE_STR_1, PacketPayload,
    VIDEO_STR_0,
};
use crate::profile::{AC3_BUFFER_SIZE, AUDIO_BUFFER_SIZE, LPCM_BUFFER_SIZE, SyntaxParams};

pub use ac3::Ac3Scanner;
pub use lpcm::LpcmScanner;
pub use mpa::MpaScanner;
pub use video::VideoScanner;

/// 视频预扫: 低于下限时补到上限
const VIDEO_LOOKAHEAD: (usize, usize) = (8, 32);
/// 音频帧较小, 预扫更多
const AUDIO_LOOKAHEAD: (usize, usize) = (32, 96);

/// AC-3 子流头: id, 帧数, 首 AU 指针
pub const AC3_SUB_HEADER_LEN: usize = 4;
/// LPCM 子流头: id, 帧数, 首 AU 指针, 帧号, 参数, 动态范围
pub const LPCM_SUB_HEADER_LEN: usize = 7;

/// 扫描器变体, 在流构造时选定
#[derive(Debug, Clone)]
pub enum Scanner {
    Mpa(MpaScanner),
    Ac3(Ac3Scanner),
    Lpcm(LpcmScanner),
    Video(VideoScanner),
}

impl Scanner {
    fn next_au(&mut self, reader: &mut BitReader) -> MuxResult<Option<AccessUnit>> {
        match self {
            Self::Mpa(s) => s.next_au(reader),
            Self::Ac3(s) => s.next_au(reader),
            Self::Lpcm(s) => s.next_au(reader),
            Self::Video(s) => s.next_au(reader),
        }
    }

    /// 标称码率 (bit/s), 0 表示可变码率
    pub fn nominal_bit_rate(&self) -> u32 {
        match self {
            Self::Mpa(s) => s.nominal_bit_rate(),
            Self::Ac3(s) => s.nominal_bit_rate(),
            Self::Lpcm(s) => s.nominal_bit_rate(),
            Self::Video(s) => s.nominal_bit_rate(),
        }
    }

    pub fn sub_header_len(&self) -> usize {
        match self {
            Self::Ac3(_) => AC3_SUB_HEADER_LEN,
            Self::Lpcm(_) => LPCM_SUB_HEADER_LEN,
            _ => 0,
        }
    }
}

/// 两个载荷上限取较紧者, 0 表示不限
fn tighter(a: usize, b: usize) -> usize {
    match (a, b) {
        (0, x) | (x, 0) => x,
        _ => a.min(b),
    }
}

/// 一条参与复用的基本流
pub struct ElementaryStream {
    name: String,
    kind: InputKind,
    reader: BitReader,
    scanner: Scanner,
    ring: AuRing,
    /// 当前 AU
    au: AccessUnit,
    /// 当前 AU 尚未送出的字节数, 0 表示流已送完
    au_unsent: u32,
    scan_done: bool,
    timestamp_delay: ClockTicks,
    bufmodel: BufferModel,
    mux: MuxStreamState,
    lookahead: (usize, usize),
    buffers_iframe_only: bool,
    timestamp_iframe_only: bool,
    dtspts_for_all_vau: bool,
    sector_align_iframe_aus: bool,
}

impl ElementaryStream {
    /// 打开输入并解析首个 AU; `index` 为同类流中的序号
    pub fn open(input: StreamInput, index: u8, params: &SyntaxParams) -> MuxResult<Self> {
        let StreamInput { kind, name, source } = input;
        let mut reader = BitReader::new(source);
        let (scanner, mux) = match kind {
            InputKind::MpegVideo => {
                let sc = VideoScanner::init(&mut reader)?;
                if sc.info().vbv_buffer_size > params.video_buffer_size {
                    log::warn!(
                        "{}: VBV 缓冲 {} 字节大于复用缓冲 {} 字节",
                        name,
                        sc.info().vbv_buffer_size,
                        params.video_buffer_size
                    );
                }
                let mux = MuxStreamState::new(VIDEO_STR_0 + index, 1, params.video_buffer_size)
                    .with_buffers(params.buffers_in_video, params.always_buffers_in_video);
                (Scanner::Video(sc), mux)
            }
            InputKind::MpegAudio => {
                let mux = MuxStreamState::new(AUDIO_STR_0 + index, 0, AUDIO_BUFFER_SIZE)
                    .with_buffers(params.buffers_in_audio, params.always_buffers_in_audio)
                    .with_zero_stuffing(params.vcd_zero_stuffing);
                (Scanner::Mpa(MpaScanner::init(&mut reader)?), mux)
            }
            InputKind::Ac3 => {
                let mux = MuxStreamState::new(PRIVATE_STR_1, 1, AC3_BUFFER_SIZE)
                    .with_sub_stream(AC3_SUB_STR_0 + index)
                    .with_buffers(params.buffers_in_audio, params.always_buffers_in_audio);
                (Scanner::Ac3(Ac3Scanner::init(&mut reader)?), mux)
            }
            InputKind::Lpcm => {
                let mux = MuxStreamState::new(PRIVATE_STR_1, 1, LPCM_BUFFER_SIZE)
                    .with_sub_stream(LPCM_SUB_STR_0 + index)
                    .with_buffers(params.buffers_in_audio, params.always_buffers_in_audio);
                (Scanner::Lpcm(LpcmScanner::init(&mut reader)?), mux)
            }
        };
        let is_video = kind.is_video();
        let mut stream = Self {
            name,
            kind,
            reader,
            scanner,
            ring: AuRing::new(),
            au: AccessUnit::default(),
            au_unsent: 0,
            scan_done: false,
            timestamp_delay: 0,
            bufmodel: BufferModel::new(mux.buffer_size),
            mux,
            lookahead: if is_video {
                VIDEO_LOOKAHEAD
            } else {
                AUDIO_LOOKAHEAD
            },
            buffers_iframe_only: is_video && params.video_buffers_iframe_only,
            timestamp_iframe_only: is_video && params.timestamp_iframe_only,
            dtspts_for_all_vau: is_video && params.dtspts_for_all_vau,
            sector_align_iframe_aus: is_video && params.sector_align_iframe_aus,
        };
        if !stream.next_au()? {
            return Err(MuxError::InvalidData(format!(
                "{} 不含任何访问单元",
                stream.name
            )));
        }
        log::debug!(
            "{}: 流 0x{:02X}{}, 缓冲 {} 字节, 码率 {} bit/s",
            stream.name,
            stream.mux.stream_id,
            stream
                .mux
                .sub_stream_id
                .map(|id| format!("/0x{:02X}", id))
                .unwrap_or_default(),
            stream.mux.buffer_size,
            stream.nominal_bit_rate()
        );
        Ok(stream)
    }

    fn fill_ahead(&mut self, n: usize) -> MuxResult<()> {
        while self.ring.len() < n && !self.scan_done {
            match self.scanner.next_au(&mut self.reader)? {
                Some(au) => self.ring.push(au)?,
                None => {
                    self.scan_done = true;
                    log::debug!(
                        "{}: 扫描结束, 共 {} 个访问单元",
                        self.name,
                        self.ring.produced_count()
                    );
                }
            }
        }
        Ok(())
    }

    fn top_up(&mut self) -> MuxResult<()> {
        if self.ring.len() < self.lookahead.0 {
            self.fill_ahead(self.lookahead.1)?;
        }
        Ok(())
    }

    /// 前进到下一个 AU, 没有更多 AU 时返回 false
    fn next_au(&mut self) -> MuxResult<bool> {
        self.top_up()?;
        match self.ring.pop() {
            Some(au) => {
                self.au = au;
                self.au_unsent = au.length;
                Ok(true)
            }
            None => {
                self.au_unsent = 0;
                Ok(false)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> InputKind {
        self.kind
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn is_video(&self) -> bool {
        matches!(self.scanner, Scanner::Video(_))
    }

    pub fn nominal_bit_rate(&self) -> u32 {
        self.scanner.nominal_bit_rate()
    }

    pub fn set_packet_limits(&mut self, max_packet_data: usize, min_packet_data: usize) {
        self.mux.max_packet_data = max_packet_data;
        self.mux.min_packet_data = min_packet_data;
    }

    pub fn set_timestamp_delay(&mut self, delay: ClockTicks) {
        self.timestamp_delay = delay;
    }

    pub fn timestamp_delay(&self) -> ClockTicks {
        self.timestamp_delay
    }

    pub fn current_au(&self) -> &AccessUnit {
        &self.au
    }

    /// 预扫中的下一个 AU
    pub fn peek_next_au(&self) -> Option<&AccessUnit> {
        self.ring.peek_next()
    }

    pub fn au_unsent(&self) -> u32 {
        self.au_unsent
    }

    /// 全部数据已送出
    pub fn is_finished(&self) -> bool {
        self.au_unsent == 0
    }

    pub fn required_dts(&self) -> ClockTicks {
        self.au.dts + self.timestamp_delay
    }

    pub fn required_pts(&self) -> ClockTicks {
        self.au.pts + self.timestamp_delay
    }

    /// 当前位于一个尚未开始发送的 I 帧起点
    pub fn at_iframe_start(&self) -> bool {
        self.au_unsent > 0
            && self.au_unsent == self.au.length
            && self.mux.new_au_next_sec
            && self.au.frame_type == FrameType::I
    }

    /// 下一个扇区以 I 帧开始, DVD 在其前插入导航扇区
    pub fn wants_nav_sector(&self) -> bool {
        self.is_video() && self.at_iframe_start()
    }

    /// 预扫范围内下一个 I 帧的 PTS (不含当前 AU)
    pub fn next_iframe_pts(&self) -> Option<ClockTicks> {
        self.ring
            .iter()
            .find(|a| a.frame_type == FrameType::I)
            .map(|a| a.pts + self.timestamp_delay)
    }

    pub fn clear_buffers(&mut self, scr: ClockTicks) {
        self.bufmodel.clear_up_to(scr);
    }

    pub fn reset_buffers(&mut self) {
        self.bufmodel.reset();
    }

    pub fn buffer_space(&self) -> i64 {
        self.bufmodel.space_remaining()
    }

    pub fn buffer_is_empty(&self) -> bool {
        self.bufmodel.is_empty()
    }

    pub fn next_buffer_change(&self) -> ClockTicks {
        self.bufmodel.next_change_time()
    }

    /// 是否可以参与本扇区调度
    pub fn is_admissible(&self, runout: Option<ClockTicks>) -> bool {
        !self.runout_complete(runout) && self.buffer_space() > self.mux.max_packet_data as i64
    }

    fn is_runout_stop(&self, au: &AccessUnit, target: ClockTicks) -> bool {
        au.pts + self.timestamp_delay >= target
            && (!self.is_video() || au.frame_type == FrameType::I)
    }

    /// 收尾是否完成: 流已送完, 或停在不早于目标时刻的新 AU (视频须为 I 帧) 起点
    pub fn runout_complete(&self, target: Option<ClockTicks>) -> bool {
        if self.au_unsent == 0 {
            return true;
        }
        match target {
            Some(t) => self.mux.new_au_next_sec && self.is_runout_stop(&self.au, t),
            None => false,
        }
    }

    /// 收尾期间到达停止点之前还可以送出的字节数; 预扫范围内找不到停止点时为 None
    fn runout_payload_limit(&self, target: ClockTicks) -> Option<usize> {
        let mut bytes = self.au_unsent as usize;
        for au in self.ring.iter() {
            if self.is_runout_stop(au, target) {
                return Some(bytes);
            }
            bytes += au.length as usize;
        }
        None
    }

    /// 新 AU 开始的分组是否写缓冲记录
    fn header_buffers(&self, frame_type: FrameType) -> bool {
        self.mux.always_buffers_in_header
            || (self.mux.buffers_in_header
                && !(self.buffers_iframe_only && frame_type != FrameType::I))
    }

    fn video_timestamps(&self, au: &AccessUnit) -> Timestamps {
        let pts = au.pts + self.timestamp_delay;
        if self.timestamp_iframe_only && au.frame_type != FrameType::I {
            Timestamps::None
        } else if au.frame_type == FrameType::B {
            Timestamps::Pts(pts)
        } else {
            Timestamps::PtsDts(pts, au.dts + self.timestamp_delay)
        }
    }

    /// 规划下一个扇区的分组参数
    pub fn plan_sector(
        &mut self,
        encoder: &PsEncoder,
        layout: &SectorLayout<'_>,
        runout: Option<ClockTicks>,
    ) -> MuxResult<SectorRequest> {
        self.top_up()?;
        let limit = runout
            .and_then(|t| self.runout_payload_limit(t))
            .unwrap_or(0);
        if self.is_video() {
            Ok(self.plan_video(encoder, layout, limit))
        } else {
            Ok(self.plan_audio(encoder, layout, limit))
        }
    }

    fn plan_audio(
        &self,
        encoder: &PsEncoder,
        layout: &SectorLayout<'_>,
        limit: usize,
    ) -> SectorRequest {
        let buffers = self.header_buffers(FrameType::None);
        // 分组以新 AU 开始
        if self.mux.new_au_next_sec {
            return SectorRequest {
                max_payload: limit,
                buffers,
                timestamps: Timestamps::Pts(self.required_pts()),
            };
        }
        let unsent = self.au_unsent as usize;
        let old_then_new = encoder.packet_payload(
            &self.mux,
            self.scanner.sub_header_len(),
            layout,
            buffers,
            Timestamps::Pts(0),
        );
        // 当前 AU 的剩余部分就能填满分组, 分组内不会开始新 AU
        if unsent >= old_then_new || (limit != 0 && unsent >= limit) {
            return SectorRequest::continuation(unsent, self.mux.always_buffers_in_header);
        }
        // 分组内开始下一个 AU, 时间戳属于它
        match self.ring.peek_next() {
            Some(next) => SectorRequest {
                max_payload: limit,
                buffers,
                timestamps: Timestamps::Pts(next.pts + self.timestamp_delay),
            },
            None => SectorRequest::continuation(unsent, self.mux.always_buffers_in_header),
        }
    }

    fn plan_video(
        &self,
        encoder: &PsEncoder,
        layout: &SectorLayout<'_>,
        limit: usize,
    ) -> SectorRequest {
        let unsent = self.au_unsent as usize;
        if self.mux.new_au_next_sec {
            let max_payload = if self.dtspts_for_all_vau {
                tighter(limit, unsent)
            } else {
                limit
            };
            return SectorRequest {
                max_payload,
                buffers: self.header_buffers(self.au.frame_type),
                timestamps: self.video_timestamps(&self.au),
            };
        }

        let next = self.ring.peek_next().copied();
        let next_type = next.map_or(FrameType::None, |a| a.frame_type);
        let old_then_new = encoder.packet_payload(
            &self.mux,
            0,
            layout,
            self.header_buffers(next_type),
            Timestamps::PtsDts(0, 0),
        );
        let align_iframe = self.sector_align_iframe_aus && next_type == FrameType::I;
        if unsent >= old_then_new || (limit != 0 && unsent >= limit) || align_iframe {
            return SectorRequest::continuation(unsent, self.mux.always_buffers_in_header);
        }
        match next {
            Some(n) => {
                let max_payload = if self.dtspts_for_all_vau {
                    tighter(limit, unsent + n.length as usize)
                } else {
                    limit
                };
                SectorRequest {
                    max_payload,
                    buffers: self.header_buffers(n.frame_type),
                    timestamps: self.video_timestamps(&n),
                }
            }
            None => SectorRequest::continuation(unsent, self.mux.always_buffers_in_header),
        }
    }

    /// 记录已送出 `bytes` 字节载荷: 更新当前 AU、解码缓冲与比特流缓冲
    fn consume(&mut self, mut bytes: u32) -> MuxResult<()> {
        self.mux.nsec += 1;
        if bytes == 0 || self.au_unsent == 0 {
            return Ok(());
        }
        let mut dts = self.required_dts();
        while self.au_unsent < bytes {
            self.bufmodel.admit(self.au_unsent, dts);
            bytes -= self.au_unsent;
            if !self.next_au()? {
                return Err(MuxError::Internal(format!(
                    "{}: 送出的载荷超过已扫描数据",
                    self.name
                )));
            }
            self.mux.new_au_next_sec = true;
            dts = self.required_dts();
        }
        self.bufmodel.admit(bytes, dts);
        if self.au_unsent > bytes {
            self.au_unsent -= bytes;
            self.mux.new_au_next_sec = false;
        } else {
            self.next_au()?;
            self.mux.new_au_next_sec = true;
        }
        let sent_bits = u64::from(self.au.length - self.au_unsent) * 8;
        self.reader.flush(self.au.start + sent_bits);
        Ok(())
    }

    /// 写私有流 1 子流头 (DVD 约定)
    ///
    /// - AC-3: `[子流号, 帧数, 指针高, 指针低]`
    /// - LPCM: 同上, 再接帧序号 (模 20)、属性字节与 0x80
    ///
    /// 帧数为本分组内起始的 AU 个数. 指针指向首个起始于本分组的 AU, 从子流头中指针之后
    /// 计数且从 1 开始 (AC-3 为载荷偏移 +1, LPCM 还要跨过其后 3 字节, 为偏移 +4);
    /// 本分组内没有 AU 起始时指针为 0.
    fn write_sub_header(&self, head: &mut [u8], au_starts: u32, first: Option<(usize, u64)>) {
        let Some(sub_id) = self.mux.sub_stream_id else {
            return;
        };
        let frames = au_starts.min(0xFF) as u8;
        match self.scanner {
            Scanner::Ac3(_) => {
                let ptr = first.map_or(0, |(offset, _)| offset + 1) as u16;
                head.copy_from_slice(&[sub_id, frames, (ptr >> 8) as u8, ptr as u8]);
            }
            Scanner::Lpcm(_) => {
                let ptr = first.map_or(0, |(offset, _)| offset + 4) as u16;
                let frame_no = first.map_or(self.au.dorder, |(_, dorder)| dorder) % 20;
                head.copy_from_slice(&[
                    sub_id,
                    frames,
                    (ptr >> 8) as u8,
                    ptr as u8,
                    frame_no as u8,
                    lpcm::attribute_byte(),
                    0x80,
                ]);
            }
            _ => {}
        }
    }
}

impl PacketPayload for ElementaryStream {
    fn mux_state(&self) -> &MuxStreamState {
        &self.mux
    }

    fn sub_header_len(&self) -> usize {
        self.scanner.sub_header_len()
    }

    fn read_payload(&mut self, dst: &mut [u8]) -> MuxResult<usize> {
        let sub_len = self.scanner.sub_header_len();
        if dst.len() < sub_len {
            return Err(MuxError::Internal(format!(
                "{}: 分组容量 {} 小于子流头",
                self.name,
                dst.len()
            )));
        }
        let (head, body) = dst.split_at_mut(sub_len);

        let mut written = 0usize;
        let mut au_starts = 0u32;
        // (首个新 AU 在载荷中的偏移, 其解码序号)
        let mut first: Option<(usize, u64)> = None;
        let mut cur = self.au;
        let mut unsent = self.au_unsent;
        if self.mux.new_au_next_sec && unsent > 0 {
            au_starts = 1;
            first = Some((0, cur.dorder));
        }
        let mut ahead = 0;
        while written < body.len() {
            if unsent == 0 {
                let Some(next) = self.ring.peek(ahead) else {
                    break;
                };
                cur = *next;
                unsent = cur.length;
                ahead += 1;
                au_starts += 1;
                first.get_or_insert((written, cur.dorder));
            }
            let n = (body.len() - written).min(unsent as usize);
            let offset = cur.start_byte() + u64::from(cur.length - unsent);
            let got = self
                .reader
                .copy_buffered(offset, &mut body[written..written + n])?;
            if got != n {
                return Err(MuxError::Internal(format!(
                    "{}: 字节 {} 处的 AU 数据不在缓冲中",
                    self.name, offset
                )));
            }
            written += n;
            unsent -= n as u32;
        }

        self.write_sub_header(head, au_starts, first);
        self.consume(written as u32)?;
        Ok(sub_len + written)
    }
}
