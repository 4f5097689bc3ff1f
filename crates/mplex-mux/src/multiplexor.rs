//! 复用驱动.
//!
//! 会话状态机: StartSegment → MidSegment → RunoutSegment → StartSegment | Done.
//! 每轮选出最紧迫的一条流输出一个扇区, SCR 随已输出字节 (按传输扇区大小) 推进.

use log::{debug, info, trace, warn};
use serde::Serialize;

use mplex_core::timestamp::{bytes_to_ticks, ms_to_ticks, ticks_to_secs};
use mplex_core::{ClockTicks, MuxError, MuxResult};

use crate::au::FrameType;
use crate::encoder::{PackHeader, PsEncoder, SectorLayout, SectorRequest, SystemHeader, Timestamps};
use crate::io::{InputKind, SectorSink, StreamInput, write_sector};
use crate::mux_stream::{
    ALL_AUDIO_STR, ALL_VIDEO_STR, BufferRecord, PRIVATE_STR_1, PacketPayload, PaddingStream,
    dvd_control_state,
};
use crate::profile::{AUDIO_BUFFER_SIZE, MuxConfig, MuxFormat, SyntaxParams};
use crate::streams::ElementaryStream;

/// 超过此欠载次数即失败
pub const UNDERRUN_LIMIT: u32 = 10;
/// 一次欠载告警后的静默扇区数
pub const UNDERRUN_WINDOW_SECTORS: u32 = 300;
/// VBR 空闲时 SCR 单次最多前推的扇区时长
const VBR_MAX_IDLE_SECTORS: u64 = 5;
/// 自动码率余量 (万分比)
const AUTO_RATE_HEADROOM: u64 = 10_205;
/// mux_rate 字段为 22 位
const MAX_MUX_RATE: u32 = (1 << 22) - 1;

const MAX_VIDEO_STREAMS: usize = 16;
const MAX_MPEG_AUDIO_STREAMS: usize = 32;
const MAX_AC3_STREAMS: usize = 8;
const MAX_LPCM_STREAMS: usize = 8;

/// 复用会话统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MuxSummary {
    pub sectors: u64,
    pub padding_sectors: u64,
    pub segments: u32,
    pub underruns: u32,
    pub bytes_written: u64,
    /// 50 字节/秒 单位
    pub mux_rate: u32,
}

/// 调度候选
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub index: usize,
    pub dts: ClockTicks,
    pub stream_id: u8,
    pub sub_stream_id: u8,
}

/// 选出 (DTS, 流 ID, 子流 ID) 最小的候选
pub fn select_most_urgent(candidates: &[Candidate]) -> Option<usize> {
    candidates
        .iter()
        .min_by_key(|c| (c.dts, c.stream_id, c.sub_stream_id))
        .map(|c| c.index)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    Start,
    Mid,
    Runout,
    Done,
}

/// 填充扇区携带的系统头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderChoice {
    None,
    Full,
    VideoOnly,
    AudioOnly,
}

/// 检查输入流组合是否符合格式限制
fn validate_inputs(params: &SyntaxParams, kinds: &[InputKind]) -> MuxResult<()> {
    if kinds.is_empty() {
        return Err(MuxError::Config("没有输入流".into()));
    }
    let count = |k: InputKind| kinds.iter().filter(|&&x| x == k).count();
    let video = count(InputKind::MpegVideo);
    let mpa = count(InputKind::MpegAudio);
    let private = count(InputKind::Ac3) + count(InputKind::Lpcm);

    for (kind, limit) in [
        (InputKind::MpegVideo, MAX_VIDEO_STREAMS),
        (InputKind::MpegAudio, MAX_MPEG_AUDIO_STREAMS),
        (InputKind::Ac3, MAX_AC3_STREAMS),
        (InputKind::Lpcm, MAX_LPCM_STREAMS),
    ] {
        if count(kind) > limit {
            return Err(MuxError::Config(format!(
                "{} 流数量 {} 超过上限 {}",
                kind.name(),
                count(kind),
                limit
            )));
        }
    }
    let format = params.format;
    if format.is_vcd() && (video > 1 || mpa > 1) {
        return Err(MuxError::Config(format!(
            "{} 最多一条视频流与一条音频流",
            format
        )));
    }
    if format.is_stills() && video != 1 {
        return Err(MuxError::Config(format!("{} 需要恰好一条视频流", format)));
    }
    if params.mpeg == 1 && private > 0 {
        return Err(MuxError::Config(format!(
            "{} 为 MPEG-1 系统层, 不支持 AC-3/LPCM",
            format
        )));
    }
    Ok(())
}

/// 由选中的流生成系统头; 私有流 1 的子流共用一条记录, 取最大缓冲
fn build_system_header<'a>(
    params: &SyntaxParams,
    streams: impl Iterator<Item = &'a ElementaryStream>,
) -> SystemHeader {
    let mut records: Vec<BufferRecord> = Vec::new();
    let mut audio_bound = 0u8;
    let mut video_bound = 0u8;
    for s in streams {
        if s.is_video() {
            video_bound += 1;
        } else {
            audio_bound += 1;
        }
        let rec = s.mux_state().buffer_record();
        match records.iter_mut().find(|r| r.stream_id == rec.stream_id) {
            Some(r) => {
                if rec.size_code > r.size_code {
                    *r = rec;
                }
            }
            None => records.push(rec),
        }
    }
    let locked = !params.format.is_generic();
    SystemHeader::new(
        0,
        !params.vbr,
        params.format.is_vcd(),
        locked,
        locked,
        records,
        audio_bound,
        video_bound,
    )
}

/// DVD 导航扇区使用的系统头
fn build_dvd_system_header(params: &SyntaxParams, streams: &[ElementaryStream]) -> SystemHeader {
    let mut records = vec![
        BufferRecord::new(ALL_VIDEO_STR, 1, params.video_buffer_size),
        BufferRecord::new(ALL_AUDIO_STR, 0, AUDIO_BUFFER_SIZE),
    ];
    records.extend(
        streams
            .iter()
            .filter(|s| s.kind() == InputKind::MpegAudio)
            .map(|s| s.mux_state().buffer_record()),
    );
    // 私有流 1 的各子流共用一条记录, 取实际子流中的最大缓冲; 没有子流时不列出
    let private_buffer = streams
        .iter()
        .filter(|s| matches!(s.kind(), InputKind::Ac3 | InputKind::Lpcm))
        .map(|s| s.mux_state().buffer_size)
        .max()
        .unwrap_or(0);
    if private_buffer > 0 {
        records.push(BufferRecord::new(PRIVATE_STR_1, 1, private_buffer));
    }
    records.push(dvd_control_state().buffer_record());
    let video_bound = streams.iter().filter(|s| s.is_video()).count() as u8;
    let audio_bound = streams.len() as u8 - video_bound;
    SystemHeader::new(0, false, false, true, true, records, audio_bound, video_bound)
}

/// 由各流码率估算复用码率 (字节/秒), 取 50 的倍数
fn auto_data_rate(params: &SyntaxParams, streams: &[ElementaryStream]) -> u64 {
    let transport = params.sector_transport_size as u64;
    let sum: u64 = streams
        .iter()
        .map(|s| {
            let min = s.mux_state().min_packet_data.max(1) as u64;
            u64::from(s.nominal_bit_rate()) * transport / (8 * min)
        })
        .sum();
    (sum * AUTO_RATE_HEADROOM / 10_000).div_ceil(50) * 50
}

/// 起始延迟扇区数: 1 + 每条视频流按缓冲估算 + 每条音频流 1
fn default_run_in_sectors(params: &SyntaxParams, streams: &[ElementaryStream]) -> u64 {
    let sector = params.sector_size as u64;
    1 + streams
        .iter()
        .map(|s| {
            if !s.is_video() {
                return 1;
            }
            let buf = u64::from(s.mux_state().buffer_size);
            if params.format.is_stills() {
                buf * 102 / 100 / sector + 2
            } else if params.vbr {
                3 * buf / (4 * sector)
            } else {
                5 * buf / (6 * sector)
            }
        })
        .sum::<u64>()
}

/// 节目流复用器
pub struct Multiplexor<S: SectorSink> {
    params: SyntaxParams,
    video_offset: ClockTicks,
    audio_offset: ClockTicks,
    ignore_underruns: bool,
    encoder: PsEncoder,
    streams: Vec<ElementaryStream>,
    /// 主流: 第一条视频流, 没有视频时为第一条流
    master: usize,
    sink: S,
    sector: Vec<u8>,
    sys_header: SystemHeader,
    vcd_video_header: Option<SystemHeader>,
    vcd_audio_header: Option<SystemHeader>,
    dvd_sys_header: Option<SystemHeader>,
    padding: PaddingStream,
    vcd_audio_padding: PaddingStream,
    /// 字节/秒
    data_rate: u32,
    mux_rate: u32,
    run_in_sectors: u64,
    /// 本分段已输出的传输字节
    bytes_output: u64,
    /// VBR 空闲时的 SCR 前推量
    scr_offset: ClockTicks,
    /// 当前文件已写字节
    segment_bytes: u64,
    /// 当前包内已有的分组数, 0 表示下一扇区开始新包
    pack_counter: u32,
    packs_in_segment: u64,
    underrun_window: u32,
    video_first_pending: bool,
    runout_target: Option<ClockTicks>,
    new_file_after_runout: bool,
    summary: MuxSummary,
    done: bool,
}

impl<S: SectorSink> Multiplexor<S> {
    /// 打开全部输入流并确定码率、系统头与起始延迟
    pub fn new(config: MuxConfig, inputs: Vec<StreamInput>, sink: S) -> MuxResult<Self> {
        let params = SyntaxParams::resolve(&config)?;
        let kinds: Vec<InputKind> = inputs.iter().map(|i| i.kind).collect();
        validate_inputs(&params, &kinds)?;

        let mut counters = [0u8; 4];
        let mut streams = Vec::with_capacity(inputs.len());
        for input in inputs {
            let slot = match input.kind {
                InputKind::MpegVideo => 0,
                InputKind::MpegAudio => 1,
                InputKind::Ac3 => 2,
                InputKind::Lpcm => 3,
            };
            let index = counters[slot];
            counters[slot] += 1;
            streams.push(ElementaryStream::open(input, index, &params)?);
        }

        let encoder = PsEncoder::new(params.mpeg, params.sector_size);
        let mut sys_header = build_system_header(&params, streams.iter());
        for s in &mut streams {
            let sub = s.sub_header_len();
            let max = encoder.packet_payload(
                s.mux_state(),
                sub,
                &SectorLayout::default(),
                false,
                Timestamps::None,
            );
            let full = SectorLayout {
                pack: Some(PackHeader {
                    scr: 0,
                    mux_rate: 0,
                }),
                sys_header: Some(&sys_header),
                end_marker: false,
            };
            let min = encoder.packet_payload(
                s.mux_state(),
                sub,
                &full,
                true,
                Timestamps::PtsDts(0, 0),
            );
            if min == 0 {
                return Err(MuxError::Config(format!(
                    "扇区大小 {} 容纳不下 {} 的分组",
                    params.sector_size,
                    s.name()
                )));
            }
            if s.mux_state().buffer_size as usize <= max {
                return Err(MuxError::Config(format!(
                    "{}: 缓冲 {} 字节不足以容纳一个分组 ({} 字节)",
                    s.name(),
                    s.mux_state().buffer_size,
                    max
                )));
            }
            s.set_packet_limits(max, min);
        }

        let data_rate = if params.auto_data_rate() {
            if let Some(s) = streams.iter().find(|s| s.nominal_bit_rate() == 0) {
                return Err(MuxError::Config(format!(
                    "{} 为可变码率, 需要指定复用码率",
                    s.name()
                )));
            }
            auto_data_rate(&params, &streams)
        } else {
            u64::from(params.data_rate).div_ceil(50) * 50
        };
        let mux_rate = data_rate / 50;
        if mux_rate == 0 || mux_rate > u64::from(MAX_MUX_RATE) {
            return Err(MuxError::Config(format!(
                "复用码率 {} 字节/秒超出范围",
                data_rate
            )));
        }
        let mux_rate = mux_rate as u32;
        let data_rate = data_rate as u32;
        sys_header.rate_bound = mux_rate;

        let format = params.format;
        let (vcd_video_header, vcd_audio_header) = if format.is_vcd() && !format.is_stills() {
            let video = streams.iter().any(|s| s.is_video()).then(|| SystemHeader {
                rate_bound: mux_rate,
                ..build_system_header(&params, streams.iter().filter(|s| s.is_video()))
            });
            let audio = streams.iter().any(|s| !s.is_video()).then(|| SystemHeader {
                rate_bound: mux_rate,
                ..build_system_header(&params, streams.iter().filter(|s| !s.is_video()))
            });
            (video, audio)
        } else {
            (None, None)
        };
        let dvd_sys_header = params.gop_control_packets.then(|| SystemHeader {
            rate_bound: mux_rate,
            ..build_dvd_system_header(&params, &streams)
        });

        let run_in_sectors = match config.run_in_sectors {
            Some(n) => u64::from(n),
            None => default_run_in_sectors(&params, &streams),
        };
        let master = streams.iter().position(|s| s.is_video()).unwrap_or(0);

        info!(
            "复用格式 {}: {} 条流, 码率 {} 字节/秒{}, 扇区 {} 字节, 起始延迟 {} 扇区",
            format,
            streams.len(),
            data_rate,
            if params.vbr { " (VBR)" } else { "" },
            params.sector_size,
            run_in_sectors
        );

        Ok(Self {
            video_offset: ms_to_ticks(config.video_offset_ms),
            audio_offset: ms_to_ticks(config.audio_offset_ms),
            ignore_underruns: config.ignore_underruns,
            sector: vec![0u8; params.sector_size],
            vcd_audio_padding: PaddingStream::vcd_audio(params.vcd_zero_stuffing),
            padding: PaddingStream::new(),
            encoder,
            streams,
            master,
            sink,
            sys_header,
            vcd_video_header,
            vcd_audio_header,
            dvd_sys_header,
            data_rate,
            mux_rate,
            run_in_sectors,
            bytes_output: 0,
            scr_offset: 0,
            segment_bytes: 0,
            pack_counter: 0,
            packs_in_segment: 0,
            underrun_window: 0,
            video_first_pending: false,
            runout_target: None,
            new_file_after_runout: false,
            summary: MuxSummary {
                mux_rate,
                ..Default::default()
            },
            done: false,
            params,
        })
    }

    pub fn params(&self) -> &SyntaxParams {
        &self.params
    }

    /// 复用码率 (字节/秒)
    pub fn data_rate(&self) -> u32 {
        self.data_rate
    }

    pub fn mux_rate(&self) -> u32 {
        self.mux_rate
    }

    pub fn run_in_sectors(&self) -> u64 {
        self.run_in_sectors
    }

    pub fn streams(&self) -> &[ElementaryStream] {
        &self.streams
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// 执行复用直到全部流送完
    pub fn multiplex(&mut self) -> MuxResult<MuxSummary> {
        if self.done {
            return Err(MuxError::InvalidArgument("复用会话已结束".into()));
        }
        let mut state = SegmentState::Start;
        while state != SegmentState::Done {
            state = match state {
                SegmentState::Start => {
                    self.start_segment()?;
                    SegmentState::Mid
                }
                SegmentState::Mid => self.mid_segment()?,
                SegmentState::Runout => self.runout_segment()?,
                SegmentState::Done => SegmentState::Done,
            };
        }
        self.sink.flush()?;
        self.done = true;
        info!(
            "复用完成: {} 个扇区 (填充 {}), {} 个分段, {} 字节, 欠载 {} 次",
            self.summary.sectors,
            self.summary.padding_sectors,
            self.summary.segments,
            self.summary.bytes_written,
            self.summary.underruns
        );
        Ok(self.summary.clone())
    }

    fn scr(&self) -> ClockTicks {
        self.scr_offset + bytes_to_ticks(self.bytes_output, self.data_rate)
    }

    fn transport_size(&self) -> u64 {
        self.params.sector_transport_size as u64
    }

    fn start_segment(&mut self) -> MuxResult<()> {
        self.summary.segments += 1;
        self.bytes_output = u64::from(self.params.transport_prefix_sectors) * self.transport_size();
        self.scr_offset = 0;
        self.pack_counter = 0;
        self.packs_in_segment = 0;
        self.runout_target = None;
        for s in &mut self.streams {
            s.reset_buffers();
        }
        self.video_first_pending = self.params.seg_starts_with_video
            && self.streams.iter().any(|s| s.is_video() && !s.is_finished());

        self.emit_prefix()?;

        let run_in =
            self.scr() + bytes_to_ticks(self.run_in_sectors * self.transport_size(), self.data_rate);
        let master_dts = self.streams[self.master].current_au().dts;
        for s in &mut self.streams {
            let offset = if s.is_video() {
                self.video_offset
            } else {
                self.audio_offset
            };
            s.set_timestamp_delay(run_in - master_dts + offset);
        }
        debug!(
            "分段 {} 开始: 起始延迟 {:.4}s, 主流 {}",
            self.summary.segments,
            ticks_to_secs(run_in),
            self.streams[self.master].name()
        );
        Ok(())
    }

    fn emit_prefix(&mut self) -> MuxResult<()> {
        let format = self.params.format;
        if format.is_stills() || format.is_svcd() {
            self.emit_padding_sector(HeaderChoice::Full, false, false)?;
        } else if format.is_vcd() {
            if self.vcd_video_header.is_some() {
                self.emit_padding_sector(HeaderChoice::VideoOnly, false, false)?;
            }
            if self.vcd_audio_header.is_some() {
                self.emit_padding_sector(HeaderChoice::AudioOnly, true, false)?;
            }
        }
        Ok(())
    }

    fn emit_suffix(&mut self) -> MuxResult<()> {
        debug!("分段 {} 结束", self.summary.segments);
        self.emit_padding_sector(HeaderChoice::None, false, true)
    }

    /// 独立成包的填充扇区 (前缀/后缀), 之后重新开始计包
    fn emit_padding_sector(
        &mut self,
        header: HeaderChoice,
        vcd_audio: bool,
        end_marker: bool,
    ) -> MuxResult<()> {
        let pack = Some(PackHeader {
            scr: self.scr(),
            mux_rate: self.mux_rate,
        });
        let sys_header = match header {
            HeaderChoice::None => None,
            HeaderChoice::Full => Some(&self.sys_header),
            HeaderChoice::VideoOnly => self.vcd_video_header.as_ref(),
            HeaderChoice::AudioOnly => self.vcd_audio_header.as_ref(),
        };
        let layout = SectorLayout {
            pack,
            sys_header,
            end_marker,
        };
        let pad = if vcd_audio {
            &mut self.vcd_audio_padding
        } else {
            &mut self.padding
        };
        self.encoder.render_sector(
            &mut self.sector,
            pad,
            &layout,
            &SectorRequest::continuation(0, false),
        )?;
        self.pack_counter = 0;
        self.finish_sector(true)
    }

    fn emit_nav_sector(&mut self) -> MuxResult<()> {
        let pack = PackHeader {
            scr: self.scr(),
            mux_rate: self.mux_rate,
        };
        let Some(sys) = self.dvd_sys_header.as_ref() else {
            return Ok(());
        };
        self.encoder.render_nav_sector(&mut self.sector, &pack, sys)?;
        self.pack_counter = 0;
        self.finish_sector(false)
    }

    /// 下一个普通扇区是否开始新包、是否携带系统头
    fn next_layout(&self) -> (Option<PackHeader>, bool) {
        if self.pack_counter != 0 {
            return (None, false);
        }
        let pack = PackHeader {
            scr: self.scr(),
            mux_rate: self.mux_rate,
        };
        let sys = self.params.always_sys_header_in_pack
            || (self.params.sys_header_in_pack1 && self.packs_in_segment == 0);
        (Some(pack), sys)
    }

    fn advance_pack(&mut self, started_pack: bool) {
        if started_pack {
            self.packs_in_segment += 1;
        }
        self.pack_counter += 1;
        if self.pack_counter >= self.params.packets_per_pack {
            self.pack_counter = 0;
        }
    }

    fn finish_sector(&mut self, padding: bool) -> MuxResult<()> {
        write_sector(&mut self.sink, &self.sector)?;
        let len = self.sector.len() as u64;
        self.bytes_output += self.transport_size();
        self.segment_bytes += len;
        self.summary.sectors += 1;
        self.summary.bytes_written += len;
        if padding {
            self.summary.padding_sectors += 1;
        }
        self.underrun_window = self.underrun_window.saturating_sub(1);
        Ok(())
    }

    fn open_next_file(&mut self) -> MuxResult<()> {
        self.sink.next_segment()?;
        self.segment_bytes = 0;
        Ok(())
    }

    fn mid_segment(&mut self) -> MuxResult<SegmentState> {
        if self.streams.iter().all(|s| s.is_finished()) {
            self.emit_suffix()?;
            return Ok(SegmentState::Done);
        }
        if self.params.max_segment_size > 0 && self.segment_bytes >= self.params.max_segment_size {
            return self.split_for_size();
        }
        if let Some(target) = self.sequence_splice_target()? {
            debug!(
                "{}: 序列结束, 收尾到 {:.4}s",
                self.streams[self.master].name(),
                ticks_to_secs(target)
            );
            self.runout_target = Some(target);
            self.new_file_after_runout = self.params.multifile_segment;
            return Ok(SegmentState::Runout);
        }
        self.dispatch(None)?;
        Ok(SegmentState::Mid)
    }

    fn runout_segment(&mut self) -> MuxResult<SegmentState> {
        let target = self.runout_target;
        if self.streams.iter().all(|s| s.runout_complete(target)) {
            self.emit_suffix()?;
            if self.streams.iter().all(|s| s.is_finished()) {
                return Ok(SegmentState::Done);
            }
            if self.new_file_after_runout {
                self.open_next_file()?;
            }
            return Ok(SegmentState::Start);
        }
        self.dispatch(target)?;
        Ok(SegmentState::Runout)
    }

    /// 文件大小达到上限: 主流停在 I 帧起点 (或无法找到 I 帧) 时直接切分, 否则收尾到下一 I 帧
    fn split_for_size(&mut self) -> MuxResult<SegmentState> {
        let master = &self.streams[self.master];
        let target = if master.is_video() && !master.at_iframe_start() {
            master.next_iframe_pts()
        } else {
            None
        };
        match target {
            Some(t) => {
                debug!(
                    "文件达到 {} 字节, 收尾到 I 帧 {:.4}s",
                    self.segment_bytes,
                    ticks_to_secs(t)
                );
                self.runout_target = Some(t);
                self.new_file_after_runout = true;
                Ok(SegmentState::Runout)
            }
            None => {
                debug!("文件达到 {} 字节, 直接切分", self.segment_bytes);
                self.emit_suffix()?;
                self.open_next_file()?;
                Ok(SegmentState::Start)
            }
        }
    }

    /// 主视频流的当前 AU 以序列结束码收尾且后面还有数据时, 返回新序列首帧的 PTS
    fn sequence_splice_target(&self) -> MuxResult<Option<ClockTicks>> {
        if self.params.format == MuxFormat::VcdStill {
            return Ok(None);
        }
        let master = &self.streams[self.master];
        if !master.is_video() || master.is_finished() || !master.current_au().end_seq {
            return Ok(None);
        }
        let Some(next) = master.peek_next_au() else {
            return Ok(None);
        };
        if !next.seq_header || next.frame_type != FrameType::I {
            return Err(MuxError::InvalidData(format!(
                "{}: 序列结束码之后不是以序列头开始的 I 帧",
                master.name()
            )));
        }
        Ok(Some(next.pts + master.timestamp_delay()))
    }

    fn dispatch(&mut self, runout: Option<ClockTicks>) -> MuxResult<()> {
        let scr = self.scr();
        for s in &mut self.streams {
            s.clear_buffers(scr);
        }
        let video_only = self.video_first_pending;
        let candidates: Vec<Candidate> = self
            .streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_admissible(runout) && (!video_only || s.is_video()))
            .map(|(index, s)| {
                let (stream_id, sub_stream_id) = s.mux_state().sort_key();
                Candidate {
                    index,
                    dts: s.required_dts(),
                    stream_id,
                    sub_stream_id,
                }
            })
            .collect();

        match select_most_urgent(&candidates) {
            Some(index) => {
                self.check_underrun(index, scr)?;
                self.output_stream_sector(index, runout)
            }
            None => self.idle(scr),
        }
    }

    fn check_underrun(&mut self, index: usize, scr: ClockTicks) -> MuxResult<()> {
        let s = &self.streams[index];
        let dts = s.required_dts();
        if dts > scr || self.underrun_window > 0 {
            return Ok(());
        }
        self.summary.underruns += 1;
        warn!(
            "{}: 缓冲欠载, DTS {:.4}s 不晚于 SCR {:.4}s (第 {} 次)",
            s.name(),
            ticks_to_secs(dts),
            ticks_to_secs(scr),
            self.summary.underruns
        );
        self.underrun_window = UNDERRUN_WINDOW_SECTORS;
        if self.summary.underruns > UNDERRUN_LIMIT && !self.ignore_underruns {
            return Err(MuxError::Underrun {
                count: self.summary.underruns,
                limit: UNDERRUN_LIMIT,
            });
        }
        Ok(())
    }

    /// 没有可调度的流: VBR 前推 SCR 到下一次缓冲变化, CBR 输出填充扇区
    fn idle(&mut self, scr: ClockTicks) -> MuxResult<()> {
        if !self.params.vbr {
            return self.emit_idle_padding();
        }
        let cap = scr + bytes_to_ticks(VBR_MAX_IDLE_SECTORS * self.transport_size(), self.data_rate);
        let next_change = self
            .streams
            .iter()
            .filter(|s| !s.is_finished() && !s.buffer_is_empty())
            .map(|s| s.next_buffer_change())
            .min();
        let target = next_change.map_or(cap, |t| (t + 1).min(cap));
        self.scr_offset += (target - scr).max(1);
        trace!(
            "VBR 空闲, SCR {:.4}s -> {:.4}s",
            ticks_to_secs(scr),
            ticks_to_secs(self.scr())
        );
        Ok(())
    }

    fn emit_idle_padding(&mut self) -> MuxResult<()> {
        let (pack, with_sys) = self.next_layout();
        let layout = SectorLayout {
            pack,
            sys_header: with_sys.then_some(&self.sys_header),
            end_marker: false,
        };
        self.encoder.render_sector(
            &mut self.sector,
            &mut self.padding,
            &layout,
            &SectorRequest::continuation(0, false),
        )?;
        trace!("扇区 {}: 填充", self.summary.sectors);
        self.advance_pack(pack.is_some());
        self.finish_sector(true)
    }

    fn output_stream_sector(&mut self, index: usize, runout: Option<ClockTicks>) -> MuxResult<()> {
        if self.params.gop_control_packets
            && index == self.master
            && self.streams[index].wants_nav_sector()
        {
            self.emit_nav_sector()?;
        }
        let scr = self.scr();
        let (pack, with_sys) = self.next_layout();
        let layout = SectorLayout {
            pack,
            sys_header: with_sys.then_some(&self.sys_header),
            end_marker: false,
        };
        let stream = &mut self.streams[index];
        let req = stream.plan_sector(&self.encoder, &layout, runout)?;
        let outcome = self
            .encoder
            .render_sector(&mut self.sector, &mut *stream, &layout, &req)?;
        trace!(
            "扇区 {}: {} SCR {:.4}s, 载荷 {}, 填充 {}/{}",
            self.summary.sectors,
            stream.name(),
            ticks_to_secs(scr),
            outcome.payload,
            outcome.stuffing,
            outcome.padding
        );
        if stream.is_video() {
            self.video_first_pending = false;
        }
        self.advance_pack(pack.is_some());
        self.finish_sector(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::{parse_pack_header, walk_sector};
    use crate::io::MemorySink;
    use std::io::Cursor;

    fn mpa_input(frames: usize) -> StreamInput {
        let mut data = Vec::new();
        for i in 0..frames {
            let mut f = vec![i as u8; 417];
            f[..4].copy_from_slice(&[0xFF, 0xFD, 0x80, 0x00]);
            data.extend(f);
        }
        StreamInput::new(InputKind::MpegAudio, "audio.mp2", Cursor::new(data))
    }

    fn candidate(index: usize, dts: ClockTicks, stream_id: u8, sub: u8) -> Candidate {
        Candidate {
            index,
            dts,
            stream_id,
            sub_stream_id: sub,
        }
    }

    #[test]
    fn test_select_most_urgent_tie_break() {
        assert_eq!(select_most_urgent(&[]), None);
        let c = [
            candidate(0, 100, 0xE0, 0),
            candidate(1, 50, 0xC0, 0),
            candidate(2, 50, 0xBD, 0x81),
            candidate(3, 50, 0xBD, 0x80),
        ];
        assert_eq!(select_most_urgent(&c), Some(3));
        assert_eq!(select_most_urgent(&c[..2]), Some(1));
    }

    #[test]
    fn test_validate_inputs() {
        let params = |format| {
            SyntaxParams::resolve(&MuxConfig {
                format,
                ..Default::default()
            })
            .unwrap()
        };
        use InputKind::*;
        assert!(validate_inputs(&params(MuxFormat::GenericMpeg1), &[]).is_err());
        assert!(validate_inputs(&params(MuxFormat::Vcd), &[MpegVideo, MpegAudio]).is_ok());
        assert!(validate_inputs(&params(MuxFormat::Vcd), &[MpegVideo, MpegVideo]).is_err());
        assert!(validate_inputs(&params(MuxFormat::GenericMpeg1), &[MpegVideo, Ac3]).is_err());
        assert!(validate_inputs(&params(MuxFormat::Dvd), &[MpegVideo, Ac3, Lpcm]).is_ok());
        assert!(validate_inputs(&params(MuxFormat::SvcdStill), &[MpegAudio]).is_err());
        assert!(validate_inputs(&params(MuxFormat::Dvd), &[Ac3; 9]).is_err());
    }

    #[test]
    fn test_explicit_data_rate() {
        let cfg = MuxConfig {
            format: MuxFormat::GenericMpeg2,
            data_rate_kbps: 1000,
            ..Default::default()
        };
        let mux = Multiplexor::new(cfg, vec![mpa_input(4)], MemorySink::new()).unwrap();
        assert_eq!(mux.data_rate(), 125_000);
        assert_eq!(mux.mux_rate(), 2500);
    }

    #[test]
    fn test_audio_only_session() {
        let _ = env_logger::builder().is_test(true).try_init();
        let run = || {
            let mut mux =
                Multiplexor::new(MuxConfig::default(), vec![mpa_input(20)], MemorySink::new())
                    .unwrap();
            assert_eq!(mux.data_rate(), 16_700);
            assert_eq!(mux.run_in_sectors(), 2);
            let summary = mux.multiplex().unwrap();
            (summary, mux.into_sink().data())
        };
        let (summary, data) = run();
        assert_eq!(summary.underruns, 0);
        assert_eq!(summary.segments, 1);
        assert_eq!(summary.mux_rate, 334);
        assert_eq!(data.len() as u64, summary.bytes_written);
        assert_eq!(data.len() % 2048, 0);
        assert_eq!(summary.sectors, (data.len() / 2048) as u64);

        let first = walk_sector(&data[..2048]).unwrap();
        let ids: Vec<u8> = first.iter().map(|u| u.stream_id).collect();
        assert_eq!(ids, vec![0xBA, 0xBB, 0xC0]);
        let pack = parse_pack_header(&data).unwrap();
        assert_eq!(pack.scr, 0);
        assert_eq!(pack.mux_rate, 334);

        let last = walk_sector(&data[data.len() - 2048..]).unwrap();
        assert_eq!(last.last().map(|u| u.stream_id), Some(0xB9));

        // 相同输入产生相同输出
        let (_, again) = run();
        assert_eq!(data, again);
    }

    #[test]
    fn test_multiplex_twice_is_rejected() {
        let mut mux =
            Multiplexor::new(MuxConfig::default(), vec![mpa_input(2)], MemorySink::new()).unwrap();
        mux.multiplex().unwrap();
        assert!(mux.multiplex().is_err());
    }

    #[test]
    fn test_underrun_window_suppresses_repeats() {
        let mut mux =
            Multiplexor::new(MuxConfig::default(), vec![mpa_input(4)], MemorySink::new()).unwrap();
        let dts = mux.streams[0].required_dts();
        // DTS 晚于 SCR 不算欠载
        mux.check_underrun(0, dts - 1).unwrap();
        assert_eq!(mux.summary.underruns, 0);

        mux.check_underrun(0, dts).unwrap();
        assert_eq!(mux.summary.underruns, 1);
        assert_eq!(mux.underrun_window, UNDERRUN_WINDOW_SECTORS);
        // 窗口内的重复欠载不再计数
        mux.check_underrun(0, dts + 1000).unwrap();
        assert_eq!(mux.summary.underruns, 1);

        mux.underrun_window = 1;
        mux.check_underrun(0, dts).unwrap();
        assert_eq!(mux.summary.underruns, 1);
        mux.underrun_window = 0;
        mux.check_underrun(0, dts).unwrap();
        assert_eq!(mux.summary.underruns, 2);
    }

    #[test]
    fn test_underrun_limit() {
        let mut mux =
            Multiplexor::new(MuxConfig::default(), vec![mpa_input(4)], MemorySink::new()).unwrap();
        let dts = mux.streams[0].required_dts();
        for _ in 0..UNDERRUN_LIMIT {
            mux.underrun_window = 0;
            mux.check_underrun(0, dts).unwrap();
        }
        assert_eq!(mux.summary.underruns, UNDERRUN_LIMIT);
        mux.underrun_window = 0;
        let err = mux.check_underrun(0, dts).unwrap_err();
        assert!(matches!(
            err,
            MuxError::Underrun {
                count: 11,
                limit: UNDERRUN_LIMIT
            }
        ));
    }

    #[test]
    fn test_ignore_underruns_keeps_counting() {
        let cfg = MuxConfig {
            ignore_underruns: true,
            ..Default::default()
        };
        let mut mux = Multiplexor::new(cfg, vec![mpa_input(4)], MemorySink::new()).unwrap();
        let dts = mux.streams[0].required_dts();
        for _ in 0..=UNDERRUN_LIMIT {
            mux.underrun_window = 0;
            mux.check_underrun(0, dts).unwrap();
        }
        assert_eq!(mux.summary.underruns, UNDERRUN_LIMIT + 1);
    }
}
