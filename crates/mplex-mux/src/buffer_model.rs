//! 解码缓冲 (STD buffer) 占用模拟.
//!
//! 每条流一个 FIFO: 送出的数据按 DTS 入队, 系统时钟越过 DTS 时出队 (解码器已消费).

use std::collections::VecDeque;

use mplex_core::ClockTicks;

#[derive(Debug, Clone, Copy)]
struct BufferEntry {
    size: u32,
    dts: ClockTicks,
}

/// 解码缓冲模型
#[derive(Debug, Clone)]
pub struct BufferModel {
    capacity: u32,
    queue: VecDeque<BufferEntry>,
    /// 当前排队字节总数
    occupied: u64,
}

impl BufferModel {
    /// 创建容量为 `capacity` 字节的缓冲模型
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            queue: VecDeque::new(),
            occupied: 0,
        }
    }

    /// 缓冲容量
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// 入队: `bytes` 字节将在 `dts` 时被解码
    pub fn admit(&mut self, bytes: u32, dts: ClockTicks) {
        self.queue.push_back(BufferEntry { size: bytes, dts });
        self.occupied += u64::from(bytes);
    }

    /// 按 FIFO 顺序移除所有 DTS 早于 `scr` 的条目
    pub fn clear_up_to(&mut self, scr: ClockTicks) {
        while let Some(front) = self.queue.front() {
            if front.dts >= scr {
                break;
            }
            self.occupied -= u64::from(front.size);
            self.queue.pop_front();
        }
    }

    /// 剩余空间 (字节), 溢出时为负
    pub fn space_remaining(&self) -> i64 {
        i64::from(self.capacity) - self.occupied as i64
    }

    /// 最早条目的 DTS, 队列为空时为 0
    pub fn next_change_time(&self) -> ClockTicks {
        self.queue.front().map_or(0, |e| e.dts)
    }

    /// 清空 (新分段开始时解码缓冲视为空)
    pub fn reset(&mut self) {
        self.queue.clear();
        self.occupied = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_and_drain_to_capacity() {
        let mut bm = BufferModel::new(46 * 1024);
        let sizes = [2000u32, 3000, 1500, 700];
        for (i, s) in sizes.iter().enumerate() {
            bm.admit(*s, 1000 * (i as ClockTicks + 1));
        }
        assert_eq!(bm.space_remaining(), 46 * 1024 - 7200);
        assert_eq!(bm.next_change_time(), 1000);

        bm.clear_up_to(4001);
        assert_eq!(bm.space_remaining(), i64::from(bm.capacity()));
        assert!(bm.is_empty());
        assert_eq!(bm.next_change_time(), 0);
    }

    #[test]
    fn test_clear_is_strictly_before_scr() {
        let mut bm = BufferModel::new(4096);
        bm.admit(100, 500);
        bm.admit(200, 600);
        bm.clear_up_to(500);
        assert_eq!(bm.space_remaining(), 4096 - 300);
        bm.clear_up_to(501);
        assert_eq!(bm.space_remaining(), 4096 - 200);
        assert_eq!(bm.next_change_time(), 600);
    }

    #[test]
    fn test_fifo_order_blocks_later_entries() {
        let mut bm = BufferModel::new(4096);
        bm.admit(100, 900);
        bm.admit(100, 100);
        // 队首未到期时, 后面的条目即使 DTS 更早也不出队
        bm.clear_up_to(500);
        assert_eq!(bm.space_remaining(), 4096 - 200);
    }

    #[test]
    fn test_reset() {
        let mut bm = BufferModel::new(1000);
        bm.admit(1200, 10);
        assert!(bm.space_remaining() < 0);
        bm.reset();
        assert_eq!(bm.space_remaining(), 1000);
    }
}
