//! 视频帧率 (有理数表示).
//!
//! MPEG 视频序列头中的 `frame_rate_code` 对应一组固定的有理帧率,
//! 场/帧计时全部基于精确的分子分母换算, 避免浮点误差累积.

use std::fmt;

use crate::timestamp::{CLOCKS, ClockTicks};

/// 帧率, 由分子和分母组成 (帧/秒 = num/den)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRate {
    /// 分子
    pub num: u32,
    /// 分母
    pub den: u32,
}

impl FrameRate {
    /// 创建新的帧率
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// 由 MPEG `frame_rate_code` (1..=8) 查表
    pub fn from_mpeg_code(code: u32) -> Option<Self> {
        let rate = match code {
            1 => Self::new(24000, 1001),
            2 => Self::new(24, 1),
            3 => Self::new(25, 1),
            4 => Self::new(30000, 1001),
            5 => Self::new(30, 1),
            6 => Self::new(50, 1),
            7 => Self::new(60000, 1001),
            8 => Self::new(60, 1),
            _ => return None,
        };
        Some(rate)
    }

    /// 判断是否有效 (分子分母均非 0)
    pub const fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    /// 转换为 f64
    pub fn to_f64(self) -> f64 {
        if self.den == 0 {
            return f64::NAN;
        }
        f64::from(self.num) / f64::from(self.den)
    }

    /// 场数转 27MHz 时钟刻度: fields * 27e6 * den / (2 * num)
    pub fn fields_to_ticks(self, fields: i64) -> ClockTicks {
        if !self.is_valid() {
            return 0;
        }
        (fields as i128 * CLOCKS as i128 * self.den as i128 / (2 * self.num as i128))
            as ClockTicks
    }

    /// 单帧时长 (27MHz 刻度)
    pub fn frame_ticks(self) -> ClockTicks {
        self.fields_to_ticks(2)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rate_code_table() {
        assert_eq!(FrameRate::from_mpeg_code(3), Some(FrameRate::new(25, 1)));
        assert_eq!(
            FrameRate::from_mpeg_code(4),
            Some(FrameRate::new(30000, 1001))
        );
        assert_eq!(FrameRate::from_mpeg_code(0), None);
        assert_eq!(FrameRate::from_mpeg_code(9), None);
    }

    #[test]
    fn test_fields_to_ticks() {
        let pal = FrameRate::new(25, 1);
        assert_eq!(pal.frame_ticks(), 1_080_000);
        assert_eq!(pal.fields_to_ticks(1), 540_000);
        // 29.97: 一帧 = 1001/30000 秒
        let ntsc = FrameRate::new(30000, 1001);
        assert_eq!(ntsc.frame_ticks(), 900_900);
    }

    #[test]
    fn test_frame_rate_display() {
        assert_eq!(FrameRate::new(24000, 1001).to_string(), "24000/1001");
        assert!((FrameRate::new(50, 1).to_f64() - 50.0).abs() < 1e-9);
    }
}
