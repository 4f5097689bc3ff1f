//! MPEG 音频 (Layer I/II/III) 帧扫描.
//!
//! 每帧一个 AU. 帧长由帧头的码率、采样率与 padding 位决定,
//! 帧边界必须落在下一个同步字上; 失配时做一次有界的字节对齐重同步.

use mplex_core::timestamp::CLOCKS;
use mplex_core::{BitReader, ClockTicks, MuxError, MuxResult};

use crate::au::AccessUnit;

/// 11 位同步字
const SYNC_WORD: u32 = 0x7FF;
/// 重同步最多前移一个最大帧长
const MAX_RESYNC_BYTES: u64 = 4 * 1024;

/// MPEG 版本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpaVersion {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

impl MpaVersion {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            3 => Some(Self::Mpeg1),
            2 => Some(Self::Mpeg2),
            0 => Some(Self::Mpeg25),
            _ => None,
        }
    }
}

/// Layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpaLayer {
    Layer1,
    Layer2,
    Layer3,
}

impl MpaLayer {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            3 => Some(Self::Layer1),
            2 => Some(Self::Layer2),
            1 => Some(Self::Layer3),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Layer1 => 0,
            Self::Layer2 => 1,
            Self::Layer3 => 2,
        }
    }
}

/// 码率表 (kbit/s): [MPEG-1 / MPEG-2(.5)][layer][index]
const BITRATES: [[[u32; 16]; 3]; 2] = [
    [
        [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448, 0],
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 0],
        [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0],
    ],
    [
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256, 0],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0],
    ],
];

/// MPEG 音频帧头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpaHeader {
    pub version: MpaVersion,
    pub layer: MpaLayer,
    /// 码率 (bit/s)
    pub bitrate: u32,
    pub sample_rate: u32,
    pub padding: bool,
    /// 声道模式 (0..=3, 3 为单声道)
    pub mode: u8,
}

impl MpaHeader {
    /// 解析 4 字节帧头
    pub fn parse(header: u32) -> MuxResult<Self> {
        // AAAAAAAA AAABBCCD EEEEFFGH IIJJKLMM
        if header >> 21 != SYNC_WORD {
            return Err(MuxError::InvalidData("MPEG 音频同步字无效".into()));
        }
        let version = MpaVersion::from_bits((header >> 19) & 0x3)
            .ok_or_else(|| MuxError::InvalidData("MPEG 音频版本为保留值".into()))?;
        let layer = MpaLayer::from_bits((header >> 17) & 0x3)
            .ok_or_else(|| MuxError::InvalidData("MPEG 音频 Layer 为保留值".into()))?;
        let bitrate_idx = ((header >> 12) & 0xF) as usize;
        if bitrate_idx == 0 || bitrate_idx == 15 {
            // 自由格式帧长不可预知, 无法复用
            return Err(MuxError::InvalidData(format!(
                "MPEG 音频码率索引 {} 不支持",
                bitrate_idx
            )));
        }
        let sr_idx = ((header >> 10) & 0x3) as usize;
        if sr_idx == 3 {
            return Err(MuxError::InvalidData("MPEG 音频采样率索引为保留值".into()));
        }
        let table = usize::from(version != MpaVersion::Mpeg1);
        let bitrate = BITRATES[table][layer.index()][bitrate_idx] * 1000;
        let sample_rate = match version {
            MpaVersion::Mpeg1 => [44100, 48000, 32000][sr_idx],
            MpaVersion::Mpeg2 => [22050, 24000, 16000][sr_idx],
            MpaVersion::Mpeg25 => [11025, 12000, 8000][sr_idx],
        };
        Ok(Self {
            version,
            layer,
            bitrate,
            sample_rate,
            padding: (header >> 9) & 0x1 == 1,
            mode: ((header >> 6) & 0x3) as u8,
        })
    }

    /// 每帧采样数
    pub fn samples_per_frame(&self) -> u32 {
        match (self.layer, self.version) {
            (MpaLayer::Layer1, _) => 384,
            (MpaLayer::Layer2, _) | (MpaLayer::Layer3, MpaVersion::Mpeg1) => 1152,
            (MpaLayer::Layer3, _) => 576,
        }
    }

    /// 帧长 (字节, 含帧头)
    pub fn frame_size(&self) -> usize {
        let br = self.bitrate as usize;
        let sr = self.sample_rate as usize;
        match self.layer {
            MpaLayer::Layer1 => (12 * br / sr + usize::from(self.padding)) * 4,
            MpaLayer::Layer3 if self.version != MpaVersion::Mpeg1 => {
                72 * br / sr + usize::from(self.padding)
            }
            _ => 144 * br / sr + usize::from(self.padding),
        }
    }
}

/// 第 n 帧的 PTS
pub fn frame_pts(n: u64, samples_per_frame: u32, sample_rate: u32) -> ClockTicks {
    (i128::from(n) * i128::from(samples_per_frame) * i128::from(CLOCKS)
        / i128::from(sample_rate)) as ClockTicks
}

/// MPEG 音频扫描器
#[derive(Debug, Clone)]
pub struct MpaScanner {
    /// 首帧参数, 决定时间基准
    first: MpaHeader,
    frames: u64,
}

impl MpaScanner {
    /// 解析首帧帧头, 不消费数据
    pub fn init(reader: &mut BitReader) -> MuxResult<Self> {
        let cp = reader.checkpoint();
        let raw = reader.read_bits(32)?;
        if reader.eos() {
            return Err(MuxError::InvalidData("MPEG 音频流为空".into()));
        }
        let first = MpaHeader::parse(raw)?;
        reader.restore(&cp)?;
        log::debug!(
            "MPEG 音频: {:?} {:?}, {} bit/s, {} Hz, 帧长 {}",
            first.version,
            first.layer,
            first.bitrate,
            first.sample_rate,
            first.frame_size()
        );
        Ok(Self { first, frames: 0 })
    }

    pub fn header(&self) -> &MpaHeader {
        &self.first
    }

    pub fn nominal_bit_rate(&self) -> u32 {
        self.first.bitrate
    }

    /// 扫描下一帧, 流正常结束时返回 None
    pub fn next_au(&mut self, reader: &mut BitReader) -> MuxResult<Option<AccessUnit>> {
        let expected = reader.bit_position();
        if reader.at_end()? {
            return Ok(None);
        }
        if !reader.seek_sync(SYNC_WORD, 11, MAX_RESYNC_BYTES)? {
            if reader.eos() {
                log::warn!(
                    "MPEG 音频流末尾 {} 字节无法同步, 已丢弃",
                    (reader.bit_position() - expected) / 8
                );
                return Ok(None);
            }
            return Err(MuxError::InvalidData(format!(
                "MPEG 音频在字节 {} 处失去同步",
                expected / 8
            )));
        }
        let start = reader.bit_position() - 11;
        if start != expected {
            log::warn!(
                "MPEG 音频在字节 {} 处重新同步, 跳过 {} 字节",
                start / 8,
                (start - expected) / 8
            );
        }
        let rest = reader.read_bits(21)?;
        let header = MpaHeader::parse((SYNC_WORD << 21) | rest)?;
        let size = header.frame_size();
        if !reader.skip_to(start + size as u64 * 8)? {
            return Err(MuxError::InvalidData(format!(
                "MPEG 音频末帧被截断 (字节 {}, 帧长 {})",
                start / 8,
                size
            )));
        }
        let pts = frame_pts(
            self.frames,
            self.first.samples_per_frame(),
            self.first.sample_rate,
        );
        let au = AccessUnit {
            start,
            length: size as u32,
            pts,
            dts: pts,
            dorder: self.frames,
            porder: self.frames,
            ..Default::default()
        };
        self.frames += 1;
        Ok(Some(au))
    }
}
