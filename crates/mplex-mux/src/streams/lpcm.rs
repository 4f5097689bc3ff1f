//! 线性 PCM 分帧.
//!
//! 无带内帧头, 参数固定为 48kHz / 2 声道 / 16 位. 每帧 1/600 秒 (90kHz 下 150 刻度),
//! 即 320 字节; 末帧可以更短.

use mplex_core::timestamp::CLOCKS_PER_90KHZ;
use mplex_core::{BitReader, ClockTicks, MuxResult};

use crate::au::AccessUnit;

pub const LPCM_SAMPLE_RATE: u32 = 48000;
pub const LPCM_CHANNELS: u32 = 2;
pub const LPCM_BITS_PER_SAMPLE: u32 = 16;
/// 每帧时长 (90kHz)
pub const LPCM_FRAME_90KHZ: i64 = 150;
/// 每帧字节数
pub const LPCM_FRAME_BYTES: u32 = LPCM_SAMPLE_RATE / 600 * LPCM_CHANNELS * LPCM_BITS_PER_SAMPLE / 8;

/// 第 n 帧的 PTS
pub fn frame_pts(n: u64) -> ClockTicks {
    n as ClockTicks * LPCM_FRAME_90KHZ * CLOCKS_PER_90KHZ
}

/// 子流头中的参数字节: bps<<6 | sr<<4 | (ch-1)
pub fn attribute_byte() -> u8 {
    // 16 位 -> 0, 48kHz -> 0
    (LPCM_CHANNELS - 1) as u8
}

/// LPCM 扫描器
#[derive(Debug, Clone, Default)]
pub struct LpcmScanner {
    frames: u64,
}

impl LpcmScanner {
    pub fn init(_reader: &mut BitReader) -> MuxResult<Self> {
        log::debug!(
            "LPCM: {} Hz, {} 声道, {} 位, 帧长 {}",
            LPCM_SAMPLE_RATE,
            LPCM_CHANNELS,
            LPCM_BITS_PER_SAMPLE,
            LPCM_FRAME_BYTES
        );
        Ok(Self::default())
    }

    pub fn nominal_bit_rate(&self) -> u32 {
        LPCM_SAMPLE_RATE * LPCM_CHANNELS * LPCM_BITS_PER_SAMPLE
    }

    /// 切出下一帧
    pub fn next_au(&mut self, reader: &mut BitReader) -> MuxResult<Option<AccessUnit>> {
        if reader.eos() {
            return Ok(None);
        }
        let start = reader.bit_position();
        reader.skip_to(start + u64::from(LPCM_FRAME_BYTES) * 8)?;
        // 数据不足时游标停在数据末尾
        let length = ((reader.bit_position() - start) / 8) as u32;
        if length == 0 {
            return Ok(None);
        }
        let pts = frame_pts(self.frames);
        let au = AccessUnit {
            start,
            length,
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
