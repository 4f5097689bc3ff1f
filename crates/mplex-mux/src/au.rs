//! 访问单元 (AU) 描述与定长环形队列.
//!
//! 每条基本流持有一个 128 槽位的环, 槽位是连续的值类型数组, 由读写游标索引,
//! 扫描器在复用游标之前预先填充.

use mplex_core::{ClockTicks, MuxError, MuxResult};

/// 环形队列容量
pub const AU_RING_CAPACITY: usize = 128;

/// 视频帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    /// 非视频 AU
    #[default]
    None,
    I,
    P,
    B,
    D,
}

impl FrameType {
    /// 由 `picture_coding_type` 转换
    pub fn from_coding_type(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::I),
            2 => Some(Self::P),
            3 => Some(Self::B),
            4 => Some(Self::D),
            _ => None,
        }
    }
}

/// 访问单元: 一帧压缩数据的描述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessUnit {
    /// 在源码流中的起始位偏移
    pub start: u64,
    /// 长度 (字节)
    pub length: u32,
    /// 显示时间戳 (27MHz)
    pub pts: ClockTicks,
    /// 解码时间戳 (27MHz)
    pub dts: ClockTicks,
    /// 解码顺序序号
    pub dorder: u64,
    /// 显示顺序序号 (仅视频)
    pub porder: u64,
    /// 帧类型 (仅视频)
    pub frame_type: FrameType,
    /// 以序列头开始
    pub seq_header: bool,
    /// 以序列结束码结尾
    pub end_seq: bool,
}

impl AccessUnit {
    /// 在源码流中的起始字节偏移
    pub fn start_byte(&self) -> u64 {
        self.start / 8
    }
}

/// 定长 AU 环形队列
pub struct AuRing {
    slots: Box<[AccessUnit; AU_RING_CAPACITY]>,
    /// 下一个读取槽位
    read: usize,
    /// 已存入未读取数量
    len: usize,
    /// 累计产出数量
    produced: u64,
}

impl Default for AuRing {
    fn default() -> Self {
        Self::new()
    }
}

impl AuRing {
    /// 创建空环, 槽位一次性分配
    pub fn new() -> Self {
        Self {
            slots: Box::new([AccessUnit::default(); AU_RING_CAPACITY]),
            read: 0,
            len: 0,
            produced: 0,
        }
    }

    /// 写入下一个槽位; 环满说明预扫距离超过容量, 属于内部错误
    pub fn push(&mut self, au: AccessUnit) -> MuxResult<()> {
        if self.len == AU_RING_CAPACITY {
            return Err(MuxError::Internal(format!(
                "AU 环已满 ({} 槽位), 预扫距离超出容量",
                AU_RING_CAPACITY,
            )));
        }
        let write = (self.read + self.len) % AU_RING_CAPACITY;
        self.slots[write] = au;
        self.len += 1;
        self.produced += 1;
        Ok(())
    }

    /// 取出下一个未读 AU
    pub fn pop(&mut self) -> Option<AccessUnit> {
        if self.len == 0 {
            return None;
        }
        let au = self.slots[self.read];
        self.read = (self.read + 1) % AU_RING_CAPACITY;
        self.len -= 1;
        Some(au)
    }

    /// 查看下一个未读 AU (不前移)
    pub fn peek_next(&self) -> Option<&AccessUnit> {
        self.peek(0)
    }

    /// 查看第 n 个未读 AU
    pub fn peek(&self, n: usize) -> Option<&AccessUnit> {
        if n >= self.len {
            return None;
        }
        Some(&self.slots[(self.read + n) % AU_RING_CAPACITY])
    }

    /// 按顺序遍历未读 AU
    pub fn iter(&self) -> impl Iterator<Item = &AccessUnit> + '_ {
        (0..self.len).map(move |i| &self.slots[(self.read + i) % AU_RING_CAPACITY])
    }

    /// 未读数量
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 空闲槽位数
    pub fn free_slots(&self) -> usize {
        AU_RING_CAPACITY - self.len
    }

    /// 累计产出的 AU 总数
    pub fn produced_count(&self) -> u64 {
        self.produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn au(n: u64) -> AccessUnit {
        AccessUnit {
            start: n * 8 * 100,
            length: 100,
            dorder: n,
            ..Default::default()
        }
    }

    #[test]
    fn test_push_pop_fifo() {
        let mut ring = AuRing::new();
        assert!(ring.pop().is_none());
        ring.push(au(0)).unwrap();
        ring.push(au(1)).unwrap();
        assert_eq!(ring.peek_next().map(|a| a.dorder), Some(0));
        assert_eq!(ring.peek(1).map(|a| a.dorder), Some(1));
        assert!(ring.peek(2).is_none());
        assert_eq!(ring.pop().map(|a| a.dorder), Some(0));
        assert_eq!(ring.pop().map(|a| a.dorder), Some(1));
        assert!(ring.is_empty());
        assert_eq!(ring.produced_count(), 2);
    }

    #[test]
    fn test_full_ring_is_error() {
        let mut ring = AuRing::new();
        for n in 0..AU_RING_CAPACITY as u64 {
            ring.push(au(n)).unwrap();
        }
        assert_eq!(ring.free_slots(), 0);
        assert!(matches!(ring.push(au(999)), Err(MuxError::Internal(_))));
    }

    #[test]
    fn test_wraparound_keeps_order() {
        let mut ring = AuRing::new();
        for n in 0..300u64 {
            ring.push(au(n)).unwrap();
            if n >= 10 {
                assert_eq!(ring.pop().map(|a| a.dorder), Some(n - 10));
            }
        }
        let rest: Vec<u64> = ring.iter().map(|a| a.dorder).collect();
        assert_eq!(rest, (290..300).collect::<Vec<_>>());
        assert_eq!(ring.produced_count(), 300);
    }

    #[test]
    fn test_frame_type_codes() {
        assert_eq!(FrameType::from_coding_type(1), Some(FrameType::I));
        assert_eq!(FrameType::from_coding_type(3), Some(FrameType::B));
        assert_eq!(FrameType::from_coding_type(0), None);
        assert_eq!(au(2).start_byte(), 200);
    }
}
