//! AC-3 同步帧扫描.

use mplex_core::timestamp::CLOCKS;
use mplex_core::{BitReader, ClockTicks, MuxError, MuxResult};

use crate::au::AccessUnit;

const SYNC_WORD: u32 = 0x0B77;
/// 最大帧长 (32kHz, 640kbit/s) 为 3840 字节
const MAX_RESYNC_BYTES: u64 = 3840;
/// 每个同步帧的采样数
pub const AC3_SAMPLES_PER_FRAME: u32 = 1536;

/// 码率表 (kbit/s), 以 frmsizecod >> 1 索引
const BITRATES: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];

const SAMPLE_RATES: [u32; 3] = [48000, 44100, 32000];

/// 帧长 (16 位字), [fscod][frmsizecod >> 1]
const FRAME_WORDS: [[u16; 19]; 3] = [
    [
        64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640, 768, 896, 1024, 1152,
        1280,
    ],
    [
        69, 87, 104, 121, 139, 174, 208, 243, 278, 348, 417, 487, 557, 696, 835, 975, 1114, 1253,
        1393,
    ],
    [
        96, 120, 144, 168, 192, 240, 288, 336, 384, 480, 576, 672, 768, 960, 1152, 1344, 1536,
        1728, 1920,
    ],
];

/// AC-3 同步信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ac3SyncInfo {
    pub fscod: u8,
    pub frmsizecod: u8,
    pub sample_rate: u32,
    /// 码率 (bit/s)
    pub bitrate: u32,
}

impl Ac3SyncInfo {
    /// 由 fscod 与 frmsizecod 构造
    pub fn new(fscod: u8, frmsizecod: u8) -> MuxResult<Self> {
        if fscod > 2 {
            return Err(MuxError::InvalidData(format!("AC-3 fscod {} 为保留值", fscod)));
        }
        if frmsizecod > 37 {
            return Err(MuxError::InvalidData(format!(
                "AC-3 frmsizecod {} 超出范围",
                frmsizecod
            )));
        }
        Ok(Self {
            fscod,
            frmsizecod,
            sample_rate: SAMPLE_RATES[fscod as usize],
            bitrate: BITRATES[(frmsizecod >> 1) as usize] * 1000,
        })
    }

    /// 帧长 (字节); 44.1kHz 且 frmsizecod 为奇数时多一个字
    pub fn frame_size(&self) -> usize {
        let words = usize::from(FRAME_WORDS[self.fscod as usize][(self.frmsizecod >> 1) as usize]);
        let extra = usize::from(self.fscod == 1 && self.frmsizecod & 1 == 1);
        (words + extra) * 2
    }
}

/// 第 n 帧的 PTS
pub fn frame_pts(n: u64, sample_rate: u32) -> ClockTicks {
    (i128::from(n) * i128::from(AC3_SAMPLES_PER_FRAME) * i128::from(CLOCKS)
        / i128::from(sample_rate)) as ClockTicks
}

/// AC-3 扫描器
#[derive(Debug, Clone)]
pub struct Ac3Scanner {
    first: Ac3SyncInfo,
    frames: u64,
}

/// 读取同步字之后的 crc1/fscod/frmsizecod
fn read_sync_info(reader: &mut BitReader) -> MuxResult<Ac3SyncInfo> {
    reader.read_bits(16)?;
    let fscod = reader.read_bits(2)? as u8;
    let frmsizecod = reader.read_bits(6)? as u8;
    Ac3SyncInfo::new(fscod, frmsizecod)
}

impl Ac3Scanner {
    /// 解析首帧同步信息, 不消费数据
    pub fn init(reader: &mut BitReader) -> MuxResult<Self> {
        let cp = reader.checkpoint();
        if reader.read_bits(16)? != SYNC_WORD || reader.eos() {
            return Err(MuxError::InvalidData("AC-3 流不以同步字开始".into()));
        }
        let first = read_sync_info(reader)?;
        reader.restore(&cp)?;
        log::debug!(
            "AC-3: {} bit/s, {} Hz, 帧长 {}",
            first.bitrate,
            first.sample_rate,
            first.frame_size()
        );
        Ok(Self { first, frames: 0 })
    }

    pub fn sync_info(&self) -> &Ac3SyncInfo {
        &self.first
    }

    pub fn nominal_bit_rate(&self) -> u32 {
        self.first.bitrate
    }

    /// 扫描下一帧
    ///
    /// 下一个同步字不在上一帧末尾时, 在 `MAX_RESYNC_BYTES` 内向前重同步并丢弃中间字节;
    /// AU 记录实际帧起点, 载荷按 AU 偏移拷贝, 被丢弃的字节不会进入输出.
    /// 超出范围仍找不到同步字则报 `InvalidData`.
    pub fn next_au(&mut self, reader: &mut BitReader) -> MuxResult<Option<AccessUnit>> {
        let expected = reader.bit_position();
        if reader.at_end()? {
            return Ok(None);
        }
        if !reader.seek_sync(SYNC_WORD, 16, MAX_RESYNC_BYTES)? {
            if reader.eos() {
                log::warn!("AC-3 流末尾存在无法同步的数据, 已丢弃");
                return Ok(None);
            }
            return Err(MuxError::InvalidData(format!(
                "AC-3 在字节 {} 处失去同步",
                expected / 8
            )));
        }
        let start = reader.bit_position() - 16;
        if start != expected {
            log::warn!(
                "AC-3 在字节 {} 处重新同步, 跳过 {} 字节",
                start / 8,
                (start - expected) / 8
            );
        }
        let info = read_sync_info(reader)?;
        let size = info.frame_size();
        if !reader.skip_to(start + size as u64 * 8)? {
            return Err(MuxError::InvalidData(format!(
                "AC-3 末帧被截断 (字节 {}, 帧长 {})",
                start / 8,
                size
            )));
        }
        let pts = frame_pts(self.frames, self.first.sample_rate);
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
